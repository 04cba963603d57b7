//! Retry schedule for push writes.
//!
//! The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to `max`.
//! Each delay is derived from the attempt number alone.

use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first write.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub first: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first: Duration::from_secs(1),
            max: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt`.
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}
