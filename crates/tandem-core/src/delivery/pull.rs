//! Pull delivery: `wait_for_updates`.
//!
//! A wait returns immediately when history already holds matching events
//! after the cursor. Otherwise it suspends until a matching publish, the
//! timeout, or cancellation. Events that arrive together are coalesced into
//! one response in ascending id order.

use crate::bus::EventBus;
use crate::error::BusError;
use crate::event::now_millis;
use crate::filter::EventFilter;
use crate::registry::{ConnectionId, ConnectionMode};
use crate::router::ChannelPattern;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{Event, EventId, Priority};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Parameters of a wait.
#[derive(Debug, Clone, Default)]
pub struct WaitRequest {
    /// Connection to wait on; generated when absent.
    pub connection_id: Option<ConnectionId>,
    /// Which events to return. `filter.since` is raised to the connection's cursor.
    pub filter: EventFilter,
    /// How long to wait; clamped to the configured maximum.
    pub timeout: Option<Duration>,
}

impl WaitRequest {
    /// Wait on a named connection.
    #[must_use]
    pub fn new(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::default()
        }
    }

    /// Set the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    /// Matching events were found.
    Updates,
    /// Nothing matched before the deadline.
    Timeout,
    /// The caller or the bus cancelled the wait.
    Cancelled,
}

/// Result of a wait.
#[derive(Debug, Clone, Serialize)]
pub struct WaitOutcome {
    pub status: WaitStatus,
    pub events: Vec<Arc<Event>>,
    /// Cursor to pass as `since` on the next wait.
    pub next_cursor: EventId,
    pub connection_id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<EventSummary>,
    pub duration_ms: u64,
}

/// Aggregate view of a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventSummary {
    /// Event counts per target, then per type.
    pub counts: BTreeMap<String, BTreeMap<&'static str, usize>>,
    /// Distinct `data.id` values per target, in first-seen order.
    pub affected: BTreeMap<String, Vec<String>>,
    pub total: usize,
    /// Event counts per priority, every priority present.
    pub priority_breakdown: BTreeMap<&'static str, usize>,
}

impl EventSummary {
    /// Summarize a batch.
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut summary = EventSummary {
            priority_breakdown: Priority::ALL.iter().map(|p| (p.as_str(), 0)).collect(),
            ..Self::default()
        };

        for event in events {
            summary.total += 1;
            *summary
                .counts
                .entry(event.target.clone())
                .or_default()
                .entry(event.event_type.as_str())
                .or_default() += 1;
            *summary
                .priority_breakdown
                .entry(event.priority.as_str())
                .or_default() += 1;
            if let Some(id) = event.resource_id() {
                let affected = summary.affected.entry(event.target.clone()).or_default();
                if !affected.contains(&id) {
                    affected.push(id);
                }
            }
        }

        summary
    }
}

/// Keeps the wait's patterns routed and the connection out of idle sweeps
/// while a wait is suspended.
struct WaitGuard<'a> {
    bus: &'a EventBus,
    id: &'a ConnectionId,
    generation: u64,
    wait: Option<u64>,
}

impl<'a> WaitGuard<'a> {
    fn new(
        bus: &'a EventBus,
        id: &'a ConnectionId,
        generation: u64,
        patterns: Vec<ChannelPattern>,
    ) -> Self {
        let wait = bus.inner.registry.begin_wait(id.as_str(), patterns);
        Self {
            bus,
            id,
            generation,
            wait,
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait {
            self.bus
                .inner
                .registry
                .end_wait(self.id.as_str(), self.generation, wait);
        }
    }
}

impl EventBus {
    /// Wait for events matching the request.
    ///
    /// Registers (or refreshes) the connection in pull mode, subscribed to
    /// `<target>:*` for each filtered target, or `*`. Concurrent waits on one
    /// connection each keep their own patterns until they finish. On `updates` the
    /// connection's cursor moves to the highest id returned. `timeout` and
    /// `cancelled` are normal outcomes and leave the cursor unchanged.
    ///
    /// Dropping the returned future is equivalent to cancelling it.
    ///
    /// # Errors
    ///
    /// - [`BusError::Validation`] if the connection id is malformed
    /// - [`BusError::ModeMismatch`] if the id is registered as a push connection
    /// - [`BusError::InvalidPattern`] if a filtered target is not a valid name
    /// - [`BusError::Capacity`] at the connection limit
    /// - [`BusError::NotRunning`] after shutdown
    pub async fn wait_for_updates(
        &self,
        request: WaitRequest,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, BusError> {
        self.ensure_running()?;
        let started = Instant::now();
        let id = ConnectionId::resolve(request.connection_id)?;

        if self.inner.registry.mode(id.as_str()) == Some(ConnectionMode::Push) {
            return Err(BusError::ModeMismatch(id.to_string()));
        }

        let channels = match request.filter.target_names() {
            [] => vec![ChannelPattern::All],
            targets => targets
                .iter()
                .map(|t| ChannelPattern::parse(&format!("{t}:*")))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let registration = self
            .inner
            .registry
            .register(id.clone(), ConnectionMode::Pull, channels.clone())?;

        let since = request
            .filter
            .since
            .map_or(registration.cursor, |since| since.max(registration.cursor));
        let filter = EventFilter {
            since: Some(since),
            ..request.filter
        };
        let timeout = self.inner.config.wait_timeout(request.timeout);
        let deadline = started + timeout;
        let guard = WaitGuard::new(self, &id, registration.generation, channels);

        trace!(connection = %id, since, timeout_ms = timeout.as_millis() as u64, "Waiting for updates");

        let (status, events) = loop {
            // Arm the wakeup before looking at history so a publish between the
            // lookup and the suspension is not missed.
            let notified = registration.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.inner.state.lock().history.query(&filter, now_millis());
            if !events.is_empty() {
                break (WaitStatus::Updates, events);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break (WaitStatus::Cancelled, Vec::new()),
                _ = registration.cancel.cancelled() => break (WaitStatus::Cancelled, Vec::new()),
                _ = sleep_until(deadline) => break (WaitStatus::Timeout, Vec::new()),
                _ = &mut notified => {}
            }
        };
        drop(guard);

        let next_cursor = match events.last() {
            Some(last) => self
                .inner
                .registry
                .advance_cursor(id.as_str(), last.id)
                .unwrap_or(last.id),
            None => since,
        };
        let summary = (status == WaitStatus::Updates)
            .then(|| EventSummary::from_events(events.iter().map(AsRef::as_ref)));

        debug!(
            connection = %id,
            status = ?status,
            events = events.len(),
            next_cursor,
            "Wait finished"
        );

        Ok(WaitOutcome {
            status,
            events,
            next_cursor,
            connection_id: id,
            summary,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
