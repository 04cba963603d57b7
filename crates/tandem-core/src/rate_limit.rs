//! Token bucket admission control.
//!
//! Refill is computed lazily from the elapsed time on each acquire, so no
//! background timer is needed.

use tokio::time::Instant;

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Maximum tokens in the bucket (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl RateLimit {
    /// A limit of `events` per minute with an equal burst.
    #[must_use]
    pub fn per_minute(events: u32) -> Self {
        Self {
            capacity: f64::from(events),
            refill_per_sec: f64::from(events) / 60.0,
        }
    }

    /// Override the burst size.
    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.capacity = f64::from(burst);
        self
    }
}

/// A single token bucket. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            tokens: limit.capacity,
            last_refill: Instant::now(),
        }
    }

    /// Try to take `cost` tokens.
    ///
    /// Returns `true` if the tokens were taken, `false` if the bucket holds fewer.
    pub fn try_acquire(&mut self, cost: u32) -> bool {
        self.refill();
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.limit.refill_per_sec).min(self.limit.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_allows_within_capacity() {
        let mut bucket = TokenBucket::new(RateLimit::per_minute(60).with_burst(5));
        for _ in 0..5 {
            assert!(bucket.try_acquire(1));
        }
        assert!(!bucket.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refill_never_recovers() {
        let mut bucket = TokenBucket::new(RateLimit::per_minute(0).with_burst(2));
        assert!(bucket.try_acquire(2));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!bucket.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_refill() {
        // 60/min = 1 token per second
        let mut bucket = TokenBucket::new(RateLimit::per_minute(60).with_burst(3));
        assert!(bucket.try_acquire(3));
        assert!(!bucket.try_acquire(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bucket.try_acquire(2));
        assert!(!bucket.try_acquire(1));

        // Never exceeds capacity
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(bucket.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_larger_than_balance() {
        let mut bucket = TokenBucket::new(RateLimit::per_minute(0).with_burst(3));
        assert!(!bucket.try_acquire(4));
        assert!(bucket.try_acquire(3));
    }
}
