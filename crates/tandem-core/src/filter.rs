//! Per-request event queries.
//!
//! An [`EventFilter`] is applied identically to history lookups and to live
//! matching. Empty lists place no constraint.

use serde::{Deserialize, Serialize};
use tandem_protocol::{Event, EventId, EventType, Priority, Source};

/// Read-only query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    /// Accepted event types.
    pub types: Option<Vec<EventType>>,
    /// Accepted targets.
    pub targets: Option<Vec<String>>,
    /// Accepted sources.
    pub sources: Option<Vec<Source>>,
    /// Minimum priority.
    pub min_priority: Priority,
    /// Only events with a greater id.
    pub since: Option<EventId>,
    /// Only events carrying this correlation id.
    pub correlation_id: Option<String>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            types: None,
            targets: None,
            sources: None,
            min_priority: Priority::Low,
            since: None,
            correlation_id: None,
        }
    }
}

fn accepts<T: PartialEq>(allowed: &Option<Vec<T>>, value: &T) -> bool {
    match allowed {
        Some(list) if !list.is_empty() => list.contains(value),
        _ => true,
    }
}

impl EventFilter {
    /// A filter accepting everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to these event types.
    #[must_use]
    pub fn with_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to these targets.
    #[must_use]
    pub fn with_targets<S: Into<String>>(mut self, targets: impl IntoIterator<Item = S>) -> Self {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to these sources.
    #[must_use]
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Source>) -> Self {
        self.sources = Some(sources.into_iter().collect());
        self
    }

    /// Require at least this priority.
    #[must_use]
    pub fn with_min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = priority;
        self
    }

    /// Only events after this id.
    #[must_use]
    pub fn since(mut self, id: EventId) -> Self {
        self.since = Some(id);
        self
    }

    /// Only events with this correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Targets named by this filter, if it names any.
    #[must_use]
    pub fn target_names(&self) -> &[String] {
        self.targets.as_deref().unwrap_or_default()
    }

    /// Whether the event satisfies every criterion.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if self.since.is_some_and(|since| event.id <= since) {
            return false;
        }
        if event.priority < self.min_priority {
            return false;
        }
        if let Some(correlation) = &self.correlation_id {
            if event.metadata.correlation_id.as_ref() != Some(correlation) {
                return false;
            }
        }
        accepts(&self.types, &event.event_type)
            && accepts(&self.sources, &event.source)
            && accepts(&self.targets, &event.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::EventMetadata;

    fn event(id: EventId, target: &str, event_type: EventType, priority: Priority) -> Event {
        Event {
            id,
            event_type,
            source: Source::Agent,
            target: target.into(),
            action: String::new(),
            data: Default::default(),
            metadata: EventMetadata::default(),
            priority,
            timestamp: 0,
            ttl: None,
        }
    }

    #[test]
    fn test_default_accepts_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&event(1, "note", EventType::Create, Priority::Low)));
    }

    #[test]
    fn test_since_is_exclusive() {
        let filter = EventFilter::new().since(5);
        assert!(!filter.matches(&event(5, "note", EventType::Create, Priority::Normal)));
        assert!(filter.matches(&event(6, "note", EventType::Create, Priority::Normal)));
    }

    #[test]
    fn test_field_constraints() {
        let filter = EventFilter::new()
            .with_types([EventType::Update, EventType::Delete])
            .with_targets(["task"])
            .with_min_priority(Priority::High);

        assert!(filter.matches(&event(1, "task", EventType::Update, Priority::High)));
        assert!(filter.matches(&event(1, "task", EventType::Delete, Priority::Critical)));
        assert!(!filter.matches(&event(1, "note", EventType::Update, Priority::High)));
        assert!(!filter.matches(&event(1, "task", EventType::Create, Priority::High)));
        assert!(!filter.matches(&event(1, "task", EventType::Update, Priority::Normal)));
    }

    #[test]
    fn test_empty_lists_do_not_constrain() {
        let filter = EventFilter::new().with_types([]).with_targets(Vec::<String>::new());
        assert!(filter.matches(&event(1, "note", EventType::Navigate, Priority::Low)));
    }

    #[test]
    fn test_correlation_and_source() {
        let mut conflict = event(2, "note", EventType::Conflict, Priority::High);
        conflict.metadata.correlation_id = Some("c-1".into());

        let filter = EventFilter::new().with_correlation_id("c-1");
        assert!(filter.matches(&conflict));
        assert!(!filter.matches(&event(3, "note", EventType::Update, Priority::High)));

        let filter = EventFilter::new().with_sources([Source::Ui]);
        assert!(!filter.matches(&conflict));
    }
}
