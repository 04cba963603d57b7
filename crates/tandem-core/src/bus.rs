//! The event bus.
//!
//! Ingestion point for every event: assigns ids, appends to history, routes to
//! registered connections and runs in-process listeners. The bus is a cheap
//! handle over shared state; clone it into every adapter that publishes.

use crate::cleanup;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::{now_millis, EventDraft};
use crate::filter::EventFilter;
use crate::history::EventHistory;
use crate::listeners::{ListenerHandle, ListenerTable};
use crate::metrics::{BusMetrics, ConnectionCounts, MetricsSnapshot};
use crate::registry::{
    Bucket, ConnectionId, ConnectionInfo, ConnectionMode, ConnectionRegistry, Registration,
};
use crate::router::{parse_patterns, ChannelPattern};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tandem_protocol::{Event, EventId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub(crate) struct BusState {
    pub(crate) history: EventHistory,
    next_id: EventId,
}

impl BusState {
    /// Id of the most recently assigned event, or 0.
    pub(crate) fn latest_id(&self) -> EventId {
        self.next_id - 1
    }
}

pub(crate) struct Inner {
    pub(crate) config: BusConfig,
    pub(crate) state: Mutex<BusState>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) metrics: BusMetrics,
    pub(crate) shutdown: CancellationToken,
    listeners: Arc<ListenerTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Result of a [`EventBus::changes_since`] query.
#[derive(Debug, Clone, Serialize)]
pub struct Changes {
    /// Non-expired events after the cursor, ascending.
    pub events: Vec<Arc<Event>>,
    /// Cursor to pass on the next call.
    pub next_cursor: EventId,
}

/// Handle to the event bus.
#[derive(Clone)]
pub struct EventBus {
    pub(crate) inner: Arc<Inner>,
}

impl EventBus {
    /// Create a bus.
    ///
    /// The bus accepts events immediately; call [`EventBus::start`] from within
    /// a runtime to run the cleanup scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidConfig`] if the configuration is unusable.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let registry =
            ConnectionRegistry::new(config.max_connections, config.rate_limit(), shutdown.child_token());

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState {
                    history: EventHistory::new(config.max_event_history),
                    next_id: 1,
                }),
                registry,
                metrics: BusMetrics::new(),
                shutdown,
                listeners: Arc::new(ListenerTable::default()),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Spawn the background cleanup and metrics loops.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotRunning`] after shutdown.
    pub fn start(&self) -> Result<(), BusError> {
        self.ensure_running()?;
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(tokio::spawn(cleanup::run(self.clone())));
        tasks.push(tokio::spawn(cleanup::log_metrics(self.clone())));
        info!(
            max_event_history = self.inner.config.max_event_history,
            max_connections = self.inner.config.max_connections,
            "Event bus started"
        );
        Ok(())
    }

    /// Stop background tasks, release every suspended wait and drop every
    /// connection. Further publishes fail with [`BusError::NotRunning`].
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let removed = self.inner.registry.clear();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(connections = removed, "Event bus shut down");
    }

    /// Whether the bus accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn ensure_running(&self) -> Result<(), BusError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BusError::NotRunning)
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish an event.
    ///
    /// Assigns the next id and the timestamp, appends to history, queues the
    /// event for every matching connection and runs matching listeners.
    /// Never waits on delivery.
    ///
    /// # Errors
    ///
    /// - [`BusError::Validation`] for malformed fields
    /// - [`BusError::RateLimited`] when the publishing connection's bucket is empty
    /// - [`BusError::NotRunning`] after shutdown
    pub fn publish(&self, draft: EventDraft) -> Result<Arc<Event>, BusError> {
        self.ensure_running()?;
        draft.validate()?;

        if let Some(origin) = &draft.origin {
            if !self
                .inner
                .registry
                .try_acquire(origin.as_str(), Bucket::Publish, 1)
            {
                self.inner.metrics.record_rate_limit_hits(1);
                warn!(connection = %origin, "Publish rate limited");
                return Err(BusError::RateLimited(origin.to_string()));
            }
            self.inner.registry.touch(origin.as_str());
        }

        // Id assignment, append and routing happen under one lock so every
        // connection observes events in id order.
        let (event, report) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let event = Arc::new(draft.seal(id, now_millis(), self.inner.config.event_ttl_seconds));
            if let Some(evicted) = state.history.push(Arc::clone(&event)) {
                trace!(event_id = evicted.id, "Evicted oldest event from history");
            }
            let report = self.inner.registry.route(&event);
            (event, report)
        };

        self.inner
            .metrics
            .record_event(event.event_type, event.source);

        if !report.rate_limited.is_empty() {
            self.inner
                .metrics
                .record_rate_limit_hits(report.rate_limited.len());
            for id in &report.rate_limited {
                warn!(connection = %id, event_id = event.id, "Delivery rate limited, event skipped");
            }
        }
        for id in &report.closed {
            debug!(connection = %id, "Push stream closed");
            self.inner.registry.unregister(id.as_str());
        }
        for id in &report.overflowed {
            self.inner.metrics.record_failed_delivery();
            warn!(connection = %id, event_id = event.id, "Push queue full, connection dropped");
            self.inner.registry.unregister(id.as_str());
        }

        debug!(
            event_id = event.id,
            target = %event.target,
            event_type = %event.event_type,
            pull = report.pull_woken,
            push = report.push_queued,
            "Event published"
        );

        self.inner.listeners.dispatch(&event);
        Ok(event)
    }

    /// Non-expired history events matching `filter`, ascending.
    #[must_use]
    pub fn history(&self, filter: &EventFilter) -> Vec<Arc<Event>> {
        self.inner.state.lock().history.query(filter, now_millis())
    }

    /// Every non-expired event after `since`, without registering or waiting.
    #[must_use]
    pub fn changes_since(&self, since: Option<EventId>) -> Changes {
        let since = since.unwrap_or(0);
        let events = self
            .inner
            .state
            .lock()
            .history
            .select(since, now_millis(), |_| true);
        let next_cursor = events.last().map_or(since, |e| e.id);
        Changes {
            events,
            next_cursor,
        }
    }

    /// Id of the most recently published event, or 0.
    #[must_use]
    pub fn latest_id(&self) -> EventId {
        self.inner.state.lock().latest_id()
    }

    /// Register a connection, or refresh an existing one.
    ///
    /// Push connections need an outbound stream and are opened with
    /// [`EventBus::subscribe`] instead.
    ///
    /// # Errors
    ///
    /// - [`BusError::Validation`] for [`ConnectionMode::Push`]
    /// - [`BusError::InvalidPattern`] if a channel does not parse
    /// - [`BusError::Capacity`] at the connection limit
    /// - [`BusError::NotRunning`] after shutdown
    pub fn register<S: AsRef<str>>(
        &self,
        id: impl Into<ConnectionId>,
        mode: ConnectionMode,
        channels: impl IntoIterator<Item = S>,
    ) -> Result<Registration, BusError> {
        self.ensure_running()?;
        if mode == ConnectionMode::Push {
            return Err(BusError::Validation(
                "push connections are opened with subscribe".into(),
            ));
        }
        let channels = parse_patterns(channels)?;
        self.inner.registry.register(id.into(), mode, channels)
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub fn unregister(&self, id: &str) {
        self.inner.registry.unregister(id);
    }

    /// Record an interaction with a connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownConnection`] for unknown ids.
    pub fn touch(&self, id: &str) -> Result<(), BusError> {
        if self.inner.registry.touch(id) {
            Ok(())
        } else {
            Err(BusError::UnknownConnection(id.to_string()))
        }
    }

    /// Record a heartbeat acknowledgement, optionally moving the cursor forward.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownConnection`] for unknown ids.
    pub fn acknowledge(&self, id: &str, cursor: Option<EventId>) -> Result<(), BusError> {
        if self.inner.registry.acknowledge(id, cursor) {
            Ok(())
        } else {
            Err(BusError::UnknownConnection(id.to_string()))
        }
    }

    /// Cursor of a connection.
    #[must_use]
    pub fn cursor(&self, id: &str) -> Option<EventId> {
        self.inner.registry.cursor(id)
    }

    /// Snapshot of one connection.
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.inner.registry.info(id)
    }

    /// Snapshot of every connection.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.list()
    }

    /// Run `handler` synchronously for every published event matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidPattern`] if the pattern does not parse.
    pub fn on<F>(&self, pattern: &str, handler: F) -> Result<ListenerHandle, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let pattern = ChannelPattern::parse(pattern)?;
        Ok(self.inner.listeners.insert(pattern, Arc::new(handler)))
    }

    /// Number of in-process listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let counts = ConnectionCounts {
            pull: self.inner.registry.count(ConnectionMode::Pull),
            push: self.inner.registry.count(ConnectionMode::Push),
        };
        let history_len = self.inner.state.lock().history.len();
        self.inner.metrics.snapshot(counts, history_len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registry", &self.inner.registry)
            .field("running", &self.is_running())
            .finish()
    }
}
