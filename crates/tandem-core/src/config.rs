//! Event bus configuration.
//!
//! Every option has a default so a partially specified configuration source
//! (file or environment) deserializes into a complete [`BusConfig`].

use crate::backoff::RetryPolicy;
use crate::error::BusError;
use crate::rate_limit::RateLimit;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of events kept in history.
    pub max_event_history: usize,
    /// Maximum number of registered connections.
    pub max_connections: usize,
    /// Token refill rate per connection, in events per minute.
    pub rate_limit_events_per_minute: u32,
    /// Token bucket capacity. Defaults to the per-minute rate.
    pub rate_limit_burst: Option<u32>,
    /// Interval of the cleanup sweep.
    pub cleanup_interval_seconds: u64,
    /// Wait timeout used when a request gives none.
    pub default_wait_timeout_seconds: u64,
    /// Upper bound for any wait timeout.
    pub max_wait_timeout_seconds: u64,
    /// Interval between heartbeats on push streams.
    pub heartbeat_interval_seconds: u64,
    /// Extra time a push stream gets to acknowledge a heartbeat.
    pub heartbeat_grace_seconds: u64,
    /// Pull connections idle longer than this are evicted.
    pub idle_timeout_seconds: u64,
    /// TTL applied to events published without one. `None` keeps them until evicted by capacity.
    pub event_ttl_seconds: Option<u64>,
    /// Attempts per push write before the connection is dropped.
    pub max_retry_attempts: u32,
    /// First retry delay.
    pub retry_delay_ms: u64,
    /// Retry delay cap.
    pub retry_max_delay_ms: u64,
    /// Frames buffered per push sink before writes start failing.
    pub outbound_buffer: usize,
    /// Interval of the metrics summary log line.
    pub metrics_log_interval_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_event_history: 1000,
            max_connections: 100,
            rate_limit_events_per_minute: 1000,
            rate_limit_burst: None,
            cleanup_interval_seconds: 60,
            default_wait_timeout_seconds: 30,
            max_wait_timeout_seconds: 300,
            heartbeat_interval_seconds: 30,
            heartbeat_grace_seconds: 30,
            idle_timeout_seconds: 600,
            event_ttl_seconds: Some(3600),
            max_retry_attempts: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            outbound_buffer: 100,
            metrics_log_interval_seconds: 300,
        }
    }
}

impl BusConfig {
    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidConfig`] naming the first offending option.
    pub fn validate(&self) -> Result<(), BusError> {
        let positive = [
            ("max_event_history", self.max_event_history as u64),
            ("max_connections", self.max_connections as u64),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("max_wait_timeout_seconds", self.max_wait_timeout_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("max_retry_attempts", u64::from(self.max_retry_attempts)),
            ("outbound_buffer", self.outbound_buffer as u64),
            ("metrics_log_interval_seconds", self.metrics_log_interval_seconds),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(BusError::InvalidConfig(format!("{name} must be greater than 0")));
        }
        if self.rate_limit().capacity < 1.0 {
            return Err(BusError::InvalidConfig(
                "rate limit capacity must allow at least one event".into(),
            ));
        }
        if self.default_wait_timeout_seconds > self.max_wait_timeout_seconds {
            return Err(BusError::InvalidConfig(
                "default_wait_timeout_seconds exceeds max_wait_timeout_seconds".into(),
            ));
        }
        Ok(())
    }

    /// Per-connection token bucket parameters.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimit {
        let limit = RateLimit::per_minute(self.rate_limit_events_per_minute);
        match self.rate_limit_burst {
            Some(burst) => limit.with_burst(burst),
            None => limit,
        }
    }

    /// Retry schedule for push writes.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            first: Duration::from_millis(self.retry_delay_ms),
            max: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
        }
    }

    /// Clamp a requested wait timeout, falling back to the default.
    #[must_use]
    pub fn wait_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_wait_timeout_seconds);
        requested
            .unwrap_or(Duration::from_secs(self.default_wait_timeout_seconds))
            .min(max)
    }

    /// Cleanup sweep interval.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Time after the last acknowledgement at which a push stream is considered dead.
    #[must_use]
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds + self.heartbeat_grace_seconds)
    }

    /// Idle threshold for pull connections.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Interval of the metrics summary log line.
    #[must_use]
    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.max_event_history, 1000);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.rate_limit_events_per_minute, 1000);
        assert_eq!(config.cleanup_interval_seconds, 60);
        assert_eq!(config.default_wait_timeout_seconds, 30);
        assert_eq!(config.max_wait_timeout_seconds, 300);
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wait_timeout_clamped() {
        let config = BusConfig::default();
        assert_eq!(config.wait_timeout(None), Duration::from_secs(30));
        assert_eq!(
            config.wait_timeout(Some(Duration::from_secs(1_000))),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.wait_timeout(Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_rate_limit_burst_override() {
        let config = BusConfig {
            rate_limit_events_per_minute: 0,
            rate_limit_burst: Some(5),
            ..Default::default()
        };
        let limit = config.rate_limit();
        assert_eq!(limit.capacity, 5.0);
        assert_eq!(limit.refill_per_sec, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = BusConfig {
            max_event_history: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BusError::InvalidConfig(msg)) if msg.contains("max_event_history")
        ));

        let config = BusConfig {
            rate_limit_events_per_minute: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize() {
        let config: BusConfig = serde_json::from_str(r#"{"max_event_history": 5}"#).unwrap();
        assert_eq!(config.max_event_history, 5);
        assert_eq!(config.max_connections, 100);
    }
}
