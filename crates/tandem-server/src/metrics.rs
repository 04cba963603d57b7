//! Prometheus export for the event bus.
//!
//! Bus counters live in `tandem-core` and are copied into the `metrics`
//! registry on a timer; per-request figures are recorded directly by the
//! handlers.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tandem_core::{EventBus, MetricsSnapshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const EVENTS_TOTAL: &str = "tandem_events_total";
    pub const EVENTS_BY_TYPE: &str = "tandem_events_by_type_total";
    pub const EVENTS_BY_SOURCE: &str = "tandem_events_by_source_total";
    pub const FAILED_DELIVERIES: &str = "tandem_failed_deliveries_total";
    pub const RATE_LIMIT_HITS: &str = "tandem_rate_limit_hits_total";
    pub const EXPIRED_EVENTS: &str = "tandem_expired_events_total";
    pub const EVICTED_CONNECTIONS: &str = "tandem_evicted_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const HISTORY_LEN: &str = "tandem_history_events";
    pub const STREAMS_TOTAL: &str = "tandem_streams_total";
    pub const STREAMS_OPEN: &str = "tandem_streams_open";
    pub const WAIT_SECONDS: &str = "tandem_wait_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events published since start");
    metrics::describe_counter!(names::EVENTS_BY_TYPE, "Events published, by type");
    metrics::describe_counter!(names::EVENTS_BY_SOURCE, "Events published, by source");
    metrics::describe_counter!(
        names::FAILED_DELIVERIES,
        "Push connections dropped after exhausting write retries"
    );
    metrics::describe_counter!(names::RATE_LIMIT_HITS, "Operations rejected by rate limiting");
    metrics::describe_counter!(names::EXPIRED_EVENTS, "Events removed after their TTL");
    metrics::describe_counter!(
        names::EVICTED_CONNECTIONS,
        "Connections removed by the cleanup sweep"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Registered connections, by mode");
    metrics::describe_gauge!(names::HISTORY_LEN, "Events currently held in history");
    metrics::describe_counter!(names::STREAMS_TOTAL, "Push streams opened, by transport");
    metrics::describe_gauge!(names::STREAMS_OPEN, "Push streams currently open, by transport");
    metrics::describe_histogram!(names::WAIT_SECONDS, "Long-poll wait duration in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "API errors, by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind its listener.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Copy bus counters into the exporter every `period` until the bus stops.
pub async fn mirror_bus(bus: EventBus, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while bus.is_running() {
        ticker.tick().await;
        publish_snapshot(&bus.metrics());
    }
    debug!("Metrics mirror stopped");
}

fn publish_snapshot(snapshot: &MetricsSnapshot) {
    counter!(names::EVENTS_TOTAL).absolute(snapshot.total_events);
    for (event_type, count) in &snapshot.events_by_type {
        counter!(names::EVENTS_BY_TYPE, "type" => *event_type).absolute(*count);
    }
    for (source, count) in &snapshot.events_by_source {
        counter!(names::EVENTS_BY_SOURCE, "source" => *source).absolute(*count);
    }
    counter!(names::FAILED_DELIVERIES).absolute(snapshot.failed_deliveries);
    counter!(names::RATE_LIMIT_HITS).absolute(snapshot.rate_limit_hits);
    counter!(names::EXPIRED_EVENTS).absolute(snapshot.expired_events);
    counter!(names::EVICTED_CONNECTIONS).absolute(snapshot.evicted_connections);
    gauge!(names::CONNECTIONS_ACTIVE, "mode" => "pull").set(snapshot.pull_connections as f64);
    gauge!(names::CONNECTIONS_ACTIVE, "mode" => "push").set(snapshot.push_connections as f64);
    gauge!(names::HISTORY_LEN).set(snapshot.history_len as f64);
}

/// Record a completed long-poll wait.
pub fn record_wait(duration_ms: u64, status: &'static str) {
    histogram!(names::WAIT_SECONDS, "status" => status).record(duration_ms as f64 / 1000.0);
}

/// Record an API error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Tracks one open push stream; records the close on drop.
pub struct StreamMetricsGuard {
    transport: &'static str,
}

impl StreamMetricsGuard {
    /// Record a stream opening on `transport`.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        counter!(names::STREAMS_TOTAL, "transport" => transport).increment(1);
        gauge!(names::STREAMS_OPEN, "transport" => transport).increment(1.0);
        Self { transport }
    }
}

impl Drop for StreamMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::STREAMS_OPEN, "transport" => self.transport).decrement(1.0);
    }
}
