//! Bus counters.
//!
//! Counters are plain atomics updated on the publish and delivery paths. The
//! bus never formats or exports them; hosts read a [`MetricsSnapshot`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_protocol::{EventType, Source};
use tokio::time::Instant;

/// Live counters.
#[derive(Debug)]
pub struct BusMetrics {
    started_at: Instant,
    total_events: AtomicU64,
    by_type: [AtomicU64; EventType::ALL.len()],
    by_source: [AtomicU64; Source::ALL.len()],
    failed_deliveries: AtomicU64,
    rate_limit_hits: AtomicU64,
    expired_events: AtomicU64,
    evicted_connections: AtomicU64,
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn index_of<T: PartialEq>(all: &[T], value: &T) -> usize {
    all.iter().position(|v| v == value).unwrap_or_default()
}

impl BusMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_events: AtomicU64::new(0),
            by_type: std::array::from_fn(|_| AtomicU64::new(0)),
            by_source: std::array::from_fn(|_| AtomicU64::new(0)),
            failed_deliveries: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            expired_events: AtomicU64::new(0),
            evicted_connections: AtomicU64::new(0),
        }
    }

    /// Count a published event.
    pub fn record_event(&self, event_type: EventType, source: Source) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.by_type[index_of(EventType::ALL, &event_type)].fetch_add(1, Ordering::Relaxed);
        self.by_source[index_of(Source::ALL, &source)].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a push connection dropped after exhausting its retries.
    pub fn record_failed_delivery(&self) {
        self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count rejected publishes or skipped deliveries.
    pub fn record_rate_limit_hits(&self, count: usize) {
        self.rate_limit_hits
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count events removed from history by TTL.
    pub fn record_expired(&self, count: usize) {
        self.expired_events.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count connections evicted by the cleanup sweep.
    pub fn record_evicted(&self, count: usize) {
        self.evicted_connections
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Total published events.
    #[must_use]
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self, connections: ConnectionCounts, history_len: usize) -> MetricsSnapshot {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let total_events = self.total_events();

        let events_by_type = EventType::ALL
            .iter()
            .zip(&self.by_type)
            .map(|(kind, count)| (kind.as_str(), count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        let events_by_source = Source::ALL
            .iter()
            .zip(&self.by_source)
            .map(|(source, count)| (source.as_str(), count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();

        MetricsSnapshot {
            uptime_seconds: uptime as u64,
            total_events,
            events_per_second: if uptime > 0.0 {
                total_events as f64 / uptime
            } else {
                0.0
            },
            events_by_type,
            events_by_source,
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            expired_events: self.expired_events.load(Ordering::Relaxed),
            evicted_connections: self.evicted_connections.load(Ordering::Relaxed),
            active_connections: connections.pull + connections.push,
            pull_connections: connections.pull,
            push_connections: connections.push,
            history_len,
        }
    }
}

/// Registered connections by mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionCounts {
    /// Pull-mode connections.
    pub pull: usize,
    /// Push-mode connections.
    pub push: usize,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_events: u64,
    pub events_per_second: f64,
    pub events_by_type: BTreeMap<&'static str, u64>,
    pub events_by_source: BTreeMap<&'static str, u64>,
    pub failed_deliveries: u64,
    pub rate_limit_hits: u64,
    pub expired_events: u64,
    pub evicted_connections: u64,
    pub active_connections: usize,
    pub pull_connections: usize,
    pub push_connections: usize,
    pub history_len: usize,
}
