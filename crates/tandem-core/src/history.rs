//! Bounded event history.
//!
//! Events are stored in ascending id order. On overflow the oldest event is
//! evicted first; expired events are skipped by every query and removed by
//! [`EventHistory::evict_expired`].

use crate::filter::EventFilter;
use std::collections::VecDeque;
use std::sync::Arc;
use tandem_protocol::{Event, EventId};

/// Ring buffer of the most recent events.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl EventHistory {
    /// Create an empty history holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append an event, returning the evicted oldest event on overflow.
    ///
    /// Callers append in ascending id order.
    pub fn push(&mut self, event: Arc<Event>) -> Option<Arc<Event>> {
        debug_assert!(self.events.back().map_or(true, |last| last.id < event.id));
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Number of stored events, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of stored events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id of the newest stored event.
    #[must_use]
    pub fn latest_id(&self) -> Option<EventId> {
        self.events.back().map(|e| e.id)
    }

    /// Id of the oldest stored event.
    #[must_use]
    pub fn oldest_id(&self) -> Option<EventId> {
        self.events.front().map(|e| e.id)
    }

    /// Non-expired events matching `filter`, in ascending id order.
    #[must_use]
    pub fn query(&self, filter: &EventFilter, now_ms: u64) -> Vec<Arc<Event>> {
        self.after(filter.since.unwrap_or(0))
            .filter(|e| !e.is_expired_at(now_ms) && filter.matches(e))
            .cloned()
            .collect()
    }

    /// Non-expired events after `since` satisfying `predicate`.
    pub fn select(
        &self,
        since: EventId,
        now_ms: u64,
        mut predicate: impl FnMut(&Event) -> bool,
    ) -> Vec<Arc<Event>> {
        self.after(since)
            .filter(|e| !e.is_expired_at(now_ms) && predicate(e))
            .cloned()
            .collect()
    }

    /// Remove every expired event, returning how many were removed.
    pub fn evict_expired(&mut self, now_ms: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|e| !e.is_expired_at(now_ms));
        before - self.events.len()
    }

    fn after(&self, since: EventId) -> impl Iterator<Item = &Arc<Event>> {
        let start = self.events.partition_point(|e| e.id <= since);
        self.events.range(start..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::{EventMetadata, EventType, Priority, Source};

    fn event(id: EventId, target: &str, ttl: Option<u64>) -> Arc<Event> {
        Arc::new(Event {
            id,
            event_type: EventType::Update,
            source: Source::Agent,
            target: target.into(),
            action: String::new(),
            data: Default::default(),
            metadata: EventMetadata::default(),
            priority: Priority::Normal,
            timestamp: id * 1_000,
            ttl,
        })
    }

    fn ids(events: &[Arc<Event>]) -> Vec<EventId> {
        events.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut history = EventHistory::new(3);
        for id in 1..=3 {
            assert!(history.push(event(id, "note", None)).is_none());
        }
        let evicted = history.push(event(4, "note", None)).unwrap();
        assert_eq!(evicted.id, 1);
        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest_id(), Some(2));
        assert_eq!(history.latest_id(), Some(4));
    }

    #[test]
    fn test_query_since_and_filter() {
        let mut history = EventHistory::new(10);
        history.push(event(1, "note", None));
        history.push(event(2, "task", None));
        history.push(event(3, "note", None));

        let all = history.query(&EventFilter::new(), 0);
        assert_eq!(ids(&all), vec![1, 2, 3]);

        let notes = history.query(&EventFilter::new().since(1).with_targets(["note"]), 0);
        assert_eq!(ids(&notes), vec![3]);

        assert!(history.query(&EventFilter::new().since(3), 0).is_empty());
    }

    #[test]
    fn test_expired_events_hidden_then_evicted() {
        let mut history = EventHistory::new(10);
        history.push(event(1, "note", Some(1))); // expires after 2_000ms
        history.push(event(2, "note", None));
        history.push(event(3, "note", Some(60)));

        let visible = history.query(&EventFilter::new(), 5_000);
        assert_eq!(ids(&visible), vec![2, 3]);
        assert_eq!(history.len(), 3);

        assert_eq!(history.evict_expired(5_000), 1);
        assert_eq!(history.len(), 2);
        assert_eq!(history.evict_expired(5_000), 0);
    }

    #[test]
    fn test_select_with_predicate() {
        let mut history = EventHistory::new(10);
        for id in 1..=5 {
            history.push(event(id, if id % 2 == 0 { "task" } else { "note" }, None));
        }
        let tasks = history.select(0, 0, |e| e.target == "task");
        assert_eq!(ids(&tasks), vec![2, 4]);
    }
}
