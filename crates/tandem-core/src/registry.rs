//! Connection registry.
//!
//! Tracks pull- and push-mode connections: their channel patterns, cursor,
//! token buckets and liveness. Every mutation happens under a shard lock held
//! only for the duration of the mutation, never across an `.await`.

use crate::error::BusError;
use crate::event::MAX_NAME_LENGTH;
use crate::rate_limit::{RateLimit, TokenBucket};
use crate::router::{matches_any, ChannelPattern};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{Event, EventId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a connection id supplied by a client.
    ///
    /// Ids travel in query strings, headers and SSE `id` fields, so they must
    /// be non-empty printable ASCII.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] for empty, overlong or non-printable ids.
    pub fn parse(id: &str) -> Result<Self, BusError> {
        validate_id(id)?;
        Ok(Self(id.to_string()))
    }

    /// Validate a caller-supplied id, or generate one.
    pub(crate) fn resolve(id: Option<Self>) -> Result<Self, BusError> {
        match id {
            Some(id) => {
                validate_id(id.as_str())?;
                Ok(id)
            }
            None => Ok(Self::generate()),
        }
    }

    /// Generate a random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn validate_id(id: &str) -> Result<(), BusError> {
    let reason = if id.is_empty() {
        "connection id cannot be empty"
    } else if id.len() > MAX_NAME_LENGTH {
        "connection id too long"
    } else if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        "connection id contains invalid characters"
    } else {
        return Ok(());
    };
    Err(BusError::Validation(reason.to_string()))
}

/// How a connection receives events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Blocking wait with timeout.
    Pull,
    /// Persistent outbound stream.
    Push,
}

/// Which token bucket to charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Events published by the connection.
    Publish,
    /// Events pushed to the connection.
    Delivery,
}

/// Handle returned by a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Connection id.
    pub id: ConnectionId,
    /// Delivery mode.
    pub mode: ConnectionMode,
    /// Distinguishes successive registrations under the same id.
    pub generation: u64,
    /// Cursor at registration time.
    pub cursor: EventId,
    /// Signalled when a matching event is published (pull mode).
    pub wake: Arc<Notify>,
    /// Cancelled when the registration ends.
    pub cancel: CancellationToken,
}

/// Read-only view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Delivery mode.
    pub mode: ConnectionMode,
    /// Channel patterns.
    pub channels: Vec<String>,
    /// Last acknowledged event id.
    pub cursor: EventId,
    /// Milliseconds since the last interaction.
    pub idle_ms: u64,
    /// Milliseconds since registration.
    pub age_ms: u64,
    /// Waits currently suspended on this connection.
    pub active_waits: usize,
}

/// Outcome of routing one event through the registry.
#[derive(Debug, Default)]
pub struct RouteReport {
    /// Pull connections whose waits were released.
    pub pull_woken: usize,
    /// Push connections the event was queued for.
    pub push_queued: usize,
    /// Push connections skipped by their delivery rate limit.
    pub rate_limited: Vec<ConnectionId>,
    /// Push connections whose stream has gone away.
    pub closed: Vec<ConnectionId>,
    /// Push connections whose outbound queue is full.
    pub overflowed: Vec<ConnectionId>,
}

/// Connections selected for eviction by a sweep.
#[derive(Debug, Default)]
pub struct StaleConnections {
    /// Pull connections idle past the threshold.
    pub idle: Vec<(ConnectionId, u64)>,
    /// Push connections that missed their heartbeat deadline, or push
    /// entries without a stream that went idle.
    pub unresponsive: Vec<(ConnectionId, u64)>,
}

struct Connection {
    mode: ConnectionMode,
    generation: u64,
    channels: Vec<ChannelPattern>,
    cursor: EventId,
    publish_bucket: TokenBucket,
    delivery_bucket: TokenBucket,
    created_at: Instant,
    last_seen: Instant,
    last_ack: Instant,
    /// Patterns of each suspended wait, keyed by wait id.
    waits: Vec<(u64, Vec<ChannelPattern>)>,
    next_wait: u64,
    wake: Arc<Notify>,
    outbound: Option<mpsc::Sender<Arc<Event>>>,
    cancel: CancellationToken,
}

impl Connection {
    fn registration(&self, id: &ConnectionId) -> Registration {
        Registration {
            id: id.clone(),
            mode: self.mode,
            generation: self.generation,
            cursor: self.cursor,
            wake: self.wake.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn info(&self, id: &ConnectionId, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: id.clone(),
            mode: self.mode,
            channels: self.channels.iter().map(ToString::to_string).collect(),
            cursor: self.cursor,
            idle_ms: now.saturating_duration_since(self.last_seen).as_millis() as u64,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            active_waits: self.waits.len(),
        }
    }

    /// Whether the connection or any of its suspended waits wants `event`.
    fn wants(&self, event: &Event) -> bool {
        matches_any(&self.channels, event)
            || self.waits.iter().any(|(_, patterns)| matches_any(patterns, event))
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn close(&self) {
        self.cancel.cancel();
        self.wake.notify_waiters();
    }
}

/// Registry of active connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    /// Serializes the capacity check with the insert.
    admission: Mutex<()>,
    generations: AtomicU64,
    max_connections: usize,
    rate_limit: RateLimit,
    root: CancellationToken,
}

impl ConnectionRegistry {
    /// Create a registry.
    ///
    /// Registration tokens are children of `root`, so cancelling it ends
    /// every registration.
    #[must_use]
    pub fn new(max_connections: usize, rate_limit: RateLimit, root: CancellationToken) -> Self {
        Self {
            connections: DashMap::new(),
            admission: Mutex::new(()),
            generations: AtomicU64::new(0),
            max_connections,
            rate_limit,
            root,
        }
    }

    /// Register a connection, or refresh an existing one.
    ///
    /// Re-registering an id in the same mode keeps its cursor, token buckets
    /// and wake handle and replaces its channels. Registering an existing id in
    /// the other mode replaces the connection but keeps its cursor.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Capacity`] when a new id would exceed the limit.
    pub fn register(
        &self,
        id: ConnectionId,
        mode: ConnectionMode,
        channels: Vec<ChannelPattern>,
    ) -> Result<Registration, BusError> {
        let _admission = self.admission.lock();

        if let Some(mut existing) = self.connections.get_mut(&id) {
            if existing.mode == mode && mode == ConnectionMode::Pull {
                existing.channels = channels;
                existing.touch();
                trace!(connection = %id, "Refreshed registration");
                return Ok(existing.registration(&id));
            }
            let cursor = existing.cursor;
            drop(existing);
            return Ok(self.replace(id, mode, channels, None, cursor));
        }

        self.admit(&id)?;
        Ok(self.insert(id, mode, channels, None, 0))
    }

    /// Register a push connection with its outbound queue.
    ///
    /// An existing registration under the same id is replaced and its stream
    /// cancelled. The cursor starts at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Capacity`] when a new id would exceed the limit.
    pub fn register_stream(
        &self,
        id: ConnectionId,
        channels: Vec<ChannelPattern>,
        outbound: mpsc::Sender<Arc<Event>>,
        cursor: EventId,
    ) -> Result<Registration, BusError> {
        let _admission = self.admission.lock();

        if self.connections.contains_key(&id) {
            return Ok(self.replace(id, ConnectionMode::Push, channels, Some(outbound), cursor));
        }

        self.admit(&id)?;
        Ok(self.insert(id, ConnectionMode::Push, channels, Some(outbound), cursor))
    }

    fn admit(&self, id: &ConnectionId) -> Result<(), BusError> {
        if self.connections.len() >= self.max_connections {
            warn!(connection = %id, max = self.max_connections, "Connection limit reached");
            return Err(BusError::Capacity(self.max_connections));
        }
        Ok(())
    }

    fn replace(
        &self,
        id: ConnectionId,
        mode: ConnectionMode,
        channels: Vec<ChannelPattern>,
        outbound: Option<mpsc::Sender<Arc<Event>>>,
        cursor: EventId,
    ) -> Registration {
        if let Some((_, old)) = self.connections.remove(&id) {
            old.close();
            debug!(connection = %id, "Replaced existing registration");
        }
        self.insert(id, mode, channels, outbound, cursor)
    }

    fn insert(
        &self,
        id: ConnectionId,
        mode: ConnectionMode,
        channels: Vec<ChannelPattern>,
        outbound: Option<mpsc::Sender<Arc<Event>>>,
        cursor: EventId,
    ) -> Registration {
        let now = Instant::now();
        let connection = Connection {
            mode,
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
            channels,
            cursor,
            publish_bucket: TokenBucket::new(self.rate_limit),
            delivery_bucket: TokenBucket::new(self.rate_limit),
            created_at: now,
            last_seen: now,
            last_ack: now,
            waits: Vec::new(),
            next_wait: 0,
            wake: Arc::new(Notify::new()),
            outbound,
            cancel: self.root.child_token(),
        };
        let registration = connection.registration(&id);
        info!(
            connection = %id,
            mode = ?mode,
            channels = ?connection.channels.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Connection registered"
        );
        self.connections.insert(id, connection);
        registration
    }

    /// Remove a connection. Unknown ids are a no-op.
    ///
    /// Returns `true` if a connection was removed.
    pub fn unregister(&self, id: &str) -> bool {
        match self.connections.remove(id) {
            Some((id, connection)) => {
                connection.close();
                info!(connection = %id, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove a connection only if it is still the given registration.
    pub fn unregister_generation(&self, id: &str, generation: u64) -> bool {
        match self
            .connections
            .remove_if(id, |_, c| c.generation == generation)
        {
            Some((id, connection)) => {
                connection.close();
                info!(connection = %id, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove every connection, returning how many were removed.
    pub fn clear(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.unregister(id.as_str())).count()
    }

    /// Record an interaction. Returns `false` for unknown ids.
    pub fn touch(&self, id: &str) -> bool {
        self.connections
            .get_mut(id)
            .map(|mut c| c.touch())
            .is_some()
    }

    /// Record a heartbeat acknowledgement, optionally advancing the cursor.
    pub fn acknowledge(&self, id: &str, cursor: Option<EventId>) -> bool {
        self.connections
            .get_mut(id)
            .map(|mut c| {
                let now = Instant::now();
                c.last_ack = now;
                c.last_seen = now;
                if let Some(cursor) = cursor {
                    c.cursor = c.cursor.max(cursor);
                }
            })
            .is_some()
    }

    /// Move the cursor forward. Never moves it backwards.
    ///
    /// Returns the resulting cursor, or `None` for unknown ids.
    pub fn advance_cursor(&self, id: &str, to: EventId) -> Option<EventId> {
        self.connections.get_mut(id).map(|mut c| {
            c.cursor = c.cursor.max(to);
            c.touch();
            c.cursor
        })
    }

    /// Current cursor of a connection.
    #[must_use]
    pub fn cursor(&self, id: &str) -> Option<EventId> {
        self.connections.get(id).map(|c| c.cursor)
    }

    /// Mode of a connection.
    #[must_use]
    pub fn mode(&self, id: &str) -> Option<ConnectionMode> {
        self.connections.get(id).map(|c| c.mode)
    }

    /// Take `cost` tokens from one of the connection's buckets.
    ///
    /// Unknown ids have no bucket and are always admitted.
    pub fn try_acquire(&self, id: &str, bucket: Bucket, cost: u32) -> bool {
        match self.connections.get_mut(id) {
            Some(mut c) => match bucket {
                Bucket::Publish => c.publish_bucket.try_acquire(cost),
                Bucket::Delivery => c.delivery_bucket.try_acquire(cost),
            },
            None => true,
        }
    }

    /// Mark the start of a suspended wait on `patterns`.
    ///
    /// Events matching any suspended wait wake the connection, whatever
    /// channels a later registration set. Sweeps skip connections with
    /// suspended waits. Returns the wait id, or `None` for unknown ids.
    pub fn begin_wait(&self, id: &str, patterns: Vec<ChannelPattern>) -> Option<u64> {
        self.connections.get_mut(id).map(|mut c| {
            c.next_wait += 1;
            let wait = c.next_wait;
            c.waits.push((wait, patterns));
            c.touch();
            wait
        })
    }

    /// Mark the end of a suspended wait.
    pub fn end_wait(&self, id: &str, generation: u64, wait: u64) {
        if let Some(mut c) = self.connections.get_mut(id) {
            if c.generation == generation {
                c.waits.retain(|(w, _)| *w != wait);
                c.touch();
            }
        }
    }

    /// Hand a freshly published event to every matching connection.
    ///
    /// Pull waiters are woken; push streams get the event queued unless their
    /// delivery bucket is empty or their outbound queue is full. Never blocks.
    pub fn route(&self, event: &Arc<Event>) -> RouteReport {
        let mut report = RouteReport::default();

        for mut entry in self.connections.iter_mut() {
            let (id, connection) = entry.pair_mut();
            if event.id <= connection.cursor || !connection.wants(event) {
                continue;
            }

            match connection.mode {
                ConnectionMode::Pull => {
                    connection.wake.notify_waiters();
                    report.pull_woken += 1;
                }
                ConnectionMode::Push => {
                    let Some(outbound) = &connection.outbound else {
                        continue;
                    };
                    if !connection.delivery_bucket.try_acquire(1) {
                        report.rate_limited.push(id.clone());
                        continue;
                    }
                    match outbound.try_send(Arc::clone(event)) {
                        Ok(()) => report.push_queued += 1,
                        Err(TrySendError::Full(_)) => report.overflowed.push(id.clone()),
                        Err(TrySendError::Closed(_)) => report.closed.push(id.clone()),
                    }
                }
            }
        }

        report
    }

    /// Connections due for eviction at `now`.
    #[must_use]
    pub fn stale(&self, idle_timeout: Duration, heartbeat_deadline: Duration) -> StaleConnections {
        let now = Instant::now();
        let mut stale = StaleConnections::default();

        for entry in self.connections.iter() {
            let c = entry.value();
            match c.mode {
                ConnectionMode::Pull => {
                    if c.waits.is_empty() && now.saturating_duration_since(c.last_seen) > idle_timeout {
                        stale.idle.push((entry.key().clone(), c.generation));
                    }
                }
                ConnectionMode::Push => {
                    let overdue = match c.outbound {
                        Some(_) => now.saturating_duration_since(c.last_ack) > heartbeat_deadline,
                        None => now.saturating_duration_since(c.last_seen) > idle_timeout,
                    };
                    if overdue {
                        stale.unresponsive.push((entry.key().clone(), c.generation));
                    }
                }
            }
        }

        stale
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections in a mode.
    #[must_use]
    pub fn count(&self, mode: ConnectionMode) -> usize {
        self.connections.iter().filter(|c| c.mode == mode).count()
    }

    /// Snapshot of one connection.
    #[must_use]
    pub fn info(&self, id: &str) -> Option<ConnectionInfo> {
        let now = Instant::now();
        self.connections.get(id).map(|c| c.info(c.key(), now))
    }

    /// Snapshot of every connection, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut all: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|c| c.info(c.key(), now))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
