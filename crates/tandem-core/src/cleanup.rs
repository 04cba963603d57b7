//! Cleanup scheduler.
//!
//! Runs on a fixed interval, independent of requests. Every eviction is
//! counted in metrics; nothing here is reported to callers.

use crate::bus::EventBus;
use crate::event::now_millis;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// History entries past their TTL.
    pub expired_events: usize,
    /// Pull connections idle past the threshold.
    pub idle_connections: usize,
    /// Push connections that missed their heartbeat deadline.
    pub dead_connections: usize,
}

impl EventBus {
    /// Run one cleanup pass now.
    pub fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let expired_events = inner.state.lock().history.evict_expired(now_millis());

        let stale = inner
            .registry
            .stale(inner.config.idle_timeout(), inner.config.heartbeat_deadline());

        let mut idle_connections = 0;
        for (id, generation) in &stale.idle {
            if inner.registry.unregister_generation(id.as_str(), *generation) {
                debug!(connection = %id, "Evicted idle connection");
                idle_connections += 1;
            }
        }
        let mut dead_connections = 0;
        for (id, generation) in &stale.unresponsive {
            if inner.registry.unregister_generation(id.as_str(), *generation) {
                warn!(connection = %id, "Evicted push connection after missed heartbeats");
                dead_connections += 1;
            }
        }

        inner.metrics.record_expired(expired_events);
        inner.metrics.record_evicted(idle_connections + dead_connections);

        let report = SweepReport {
            expired_events,
            idle_connections,
            dead_connections,
        };
        if report != SweepReport::default() {
            info!(
                expired_events,
                idle_connections, dead_connections, "Cleanup sweep"
            );
        }
        report
    }
}

pub(crate) async fn run(bus: EventBus) {
    let period = bus.config().cleanup_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = bus.inner.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                bus.sweep();
            }
        }
    }
    debug!("Cleanup scheduler stopped");
}

pub(crate) async fn log_metrics(bus: EventBus) {
    let period = bus.config().metrics_log_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = bus.inner.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let m = bus.metrics();
                info!(
                    total_events = m.total_events,
                    events_per_second = m.events_per_second,
                    active_connections = m.active_connections,
                    failed_deliveries = m.failed_deliveries,
                    rate_limit_hits = m.rate_limit_hits,
                    history = m.history_len,
                    "Event bus metrics"
                );
            }
        }
    }
}
