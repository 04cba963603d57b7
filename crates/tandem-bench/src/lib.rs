//! Shared fixtures for the benchmarks.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{BusConfig, DeliveryError, EventBus, EventDraft, PushSink};
use tandem_protocol::{EventType, Frame};

/// A bus sized for load: no rate limiting, room for `connections`, and push
/// queues deep enough that bursts do not evict streams.
#[must_use]
pub fn bench_bus(connections: usize) -> EventBus {
    let config = BusConfig {
        max_connections: connections.max(1),
        rate_limit_events_per_minute: u32::MAX,
        outbound_buffer: 1 << 16,
        ..BusConfig::default()
    };
    EventBus::new(config).expect("benchmark bus config is valid")
}

/// A small event aimed at `target`.
#[must_use]
pub fn draft(target: &str, event_type: EventType) -> EventDraft {
    EventDraft::new(target, event_type, "bench")
        .with_field("id", "res-1")
        .with_field("title", "benchmark payload")
}

/// Counts delivered events and discards every frame.
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    events: Arc<AtomicU64>,
}

impl CountingSink {
    /// Events received so far, across all clones.
    #[must_use]
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Reset the counter.
    pub fn reset(&self) {
        self.events.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl PushSink for CountingSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), DeliveryError> {
        if matches!(frame, Frame::Event { .. }) {
            self.events.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
