//! Push delivery: persistent streams.
//!
//! Each subscription owns a worker task that drains the connection's outbound
//! queue into a [`PushSink`]. Publishing only enqueues; the worker writes,
//! retries failed writes with exponential backoff and emits heartbeats.
//!
//! The queue holds at most `outbound_buffer` events. A connection whose queue
//! is full when an event is routed is dropped, and a pending write is
//! abandoned as soon as the connection is unregistered.

use crate::backoff::RetryPolicy;
use crate::bus::EventBus;
use crate::error::BusError;
use crate::event::now_millis;
use crate::registry::{ConnectionId, ConnectionMode, Registration};
use crate::router::{matches_any, parse_patterns};
use async_trait::async_trait;
use std::sync::Arc;
use tandem_protocol::{Event, EventId, Frame};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A failed push write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The peer has gone away. Not retried.
    #[error("Connection closed")]
    Closed,

    /// The write did not complete in time.
    #[error("Write timed out")]
    Timeout,

    /// Any other transport failure.
    #[error("Write failed: {0}")]
    Failed(String),
}

/// Outbound half of a push transport.
#[async_trait]
pub trait PushSink: Send + 'static {
    /// Write one frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), DeliveryError>;

    /// Whether the peer answers heartbeats with acks.
    ///
    /// For one-way transports a successful heartbeat write stands in for the
    /// acknowledgement.
    fn acknowledges(&self) -> bool {
        false
    }

    /// Release the transport once the stream ends.
    async fn close(&mut self) {}
}

/// Parameters of a push subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeRequest {
    /// Connection id; generated when absent. An existing push stream under
    /// the same id is replaced.
    pub connection_id: Option<ConnectionId>,
    /// Channel patterns; empty means `*`.
    pub channels: Vec<String>,
    /// Replay matching history after this id before live events.
    pub since: Option<EventId>,
}

impl SubscribeRequest {
    /// Subscribe a named connection.
    #[must_use]
    pub fn new<S: Into<String>>(
        connection_id: impl Into<ConnectionId>,
        channels: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            channels: channels.into_iter().map(Into::into).collect(),
            since: None,
        }
    }

    /// Replay from this id.
    #[must_use]
    pub fn since(mut self, since: EventId) -> Self {
        self.since = Some(since);
        self
    }
}

/// An active push subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    /// Normalized channel patterns.
    pub channels: Vec<String>,
    /// History events queued ahead of live delivery.
    pub replayed: usize,
    /// Cancelled when the stream ends.
    pub closed: CancellationToken,
}

impl EventBus {
    /// Open a push stream writing into `sink`.
    ///
    /// The stream starts with a `connected` frame, then replays history after
    /// `since`, then delivers live events and heartbeats until the connection
    /// is unsubscribed, the sink closes, or writes keep failing.
    ///
    /// # Errors
    ///
    /// - [`BusError::Validation`] if the connection id is malformed
    /// - [`BusError::InvalidPattern`] if a channel does not parse
    /// - [`BusError::Capacity`] at the connection limit
    /// - [`BusError::NotRunning`] after shutdown or outside a tokio runtime
    pub fn subscribe<S: PushSink>(
        &self,
        request: SubscribeRequest,
        sink: S,
    ) -> Result<Subscription, BusError> {
        self.ensure_running()?;
        let runtime = Handle::try_current().map_err(|_| BusError::NotRunning)?;
        let patterns = parse_patterns(&request.channels)?;
        let channels: Vec<String> = patterns.iter().map(ToString::to_string).collect();
        let id = ConnectionId::resolve(request.connection_id)?;
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_buffer);

        // Replay and registration share the history lock, so no event falls
        // between the replayed batch and the first live one.
        let (registration, replay) = {
            let state = self.inner.state.lock();
            let latest = state.latest_id();
            let cursor = request.since.map_or(latest, |since| since.min(latest));
            let replay = state
                .history
                .select(cursor, now_millis(), |e| matches_any(&patterns, e));
            let registration = self
                .inner
                .registry
                .register_stream(id.clone(), patterns, tx, cursor)?;
            (registration, replay)
        };

        info!(
            connection = %id,
            channels = ?channels,
            replayed = replay.len(),
            "Push stream opened"
        );

        let subscription = Subscription {
            connection_id: id,
            channels: channels.clone(),
            replayed: replay.len(),
            closed: registration.cancel.clone(),
        };
        runtime.spawn(run_stream(self.clone(), registration, channels, replay, rx, sink));
        Ok(subscription)
    }

    /// End a push stream. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: &str) {
        if self.inner.registry.mode(id) == Some(ConnectionMode::Push) {
            self.inner.registry.unregister(id);
        }
    }
}

struct Stream<S> {
    bus: EventBus,
    registration: Registration,
    policy: RetryPolicy,
    sink: S,
    cursor: EventId,
}

async fn run_stream<S: PushSink>(
    bus: EventBus,
    registration: Registration,
    channels: Vec<String>,
    replay: Vec<Arc<Event>>,
    rx: mpsc::Receiver<Arc<Event>>,
    sink: S,
) {
    let mut stream = Stream {
        policy: bus.config().retry_policy(),
        cursor: registration.cursor,
        bus,
        registration,
        sink,
    };
    let id = stream.registration.id.clone();

    let result = stream.serve(channels, replay, rx).await;
    stream.sink.close().await;

    let registry = &stream.bus.inner.registry;
    let generation = stream.registration.generation;
    match result {
        Ok(()) => debug!(connection = %id, "Push stream ended"),
        Err(DeliveryError::Closed) => {
            registry.unregister_generation(id.as_str(), generation);
            debug!(connection = %id, "Push stream closed by peer");
        }
        Err(e) => {
            stream.bus.inner.metrics.record_failed_delivery();
            registry.unregister_generation(id.as_str(), generation);
            error!(connection = %id, error = %e, "Push delivery failed, connection dropped");
        }
    }
}

impl<S: PushSink> Stream<S> {
    async fn serve(
        &mut self,
        channels: Vec<String>,
        replay: Vec<Arc<Event>>,
        mut rx: mpsc::Receiver<Arc<Event>>,
    ) -> Result<(), DeliveryError> {
        let period = self.bus.config().heartbeat_interval();
        let hello = Frame::connected(
            self.registration.id.as_str(),
            channels,
            u32::try_from(period.as_millis()).unwrap_or(u32::MAX),
            replay.len(),
        );
        self.deliver(&hello).await?;

        for event in replay {
            self.deliver_event(&event).await?;
        }

        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 0u64;
        let cancel = self.registration.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Some(event) => self.deliver_event(&event).await?,
                    None => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    seq += 1;
                    self.deliver(&Frame::heartbeat(seq, now_millis())).await?;
                    if !self.sink.acknowledges() {
                        self.bus.inner.registry.acknowledge(self.registration.id.as_str(), None);
                    }
                }
            }
        }
    }

    async fn deliver_event(&mut self, event: &Arc<Event>) -> Result<(), DeliveryError> {
        if event.id <= self.cursor {
            return Ok(());
        }
        self.deliver(&Frame::event(Event::clone(event))).await?;
        self.cursor = event.id;
        if !self.registration.cancel.is_cancelled() {
            self.bus
                .inner
                .registry
                .advance_cursor(self.registration.id.as_str(), event.id);
        }
        Ok(())
    }

    /// Write a frame, retrying transient failures with backoff.
    ///
    /// Ending the registration abandons the write.
    async fn deliver(&mut self, frame: &Frame) -> Result<(), DeliveryError> {
        let cancel = self.registration.cancel.clone();
        let mut attempt = 0;
        loop {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeliveryError::Closed),
                sent = self.sink.send(frame) => sent,
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(DeliveryError::Closed) => return Err(DeliveryError::Closed),
                Err(e) if self.policy.should_retry(attempt) => {
                    let delay = self.policy.next(attempt);
                    warn!(
                        connection = %self.registration.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Push write failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DeliveryError::Closed),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
