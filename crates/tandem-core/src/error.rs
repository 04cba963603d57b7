//! Errors surfaced synchronously by the event bus.
//!
//! Only malformed input and resource exhaustion at the point of call are
//! reported here. Per-connection delivery failures are counted in metrics and
//! never reach the publisher.

use tandem_protocol::UnknownVariant;
use thiserror::Error;

/// Event bus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Malformed input. An invalid event never enters history.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The connection's token bucket is exhausted.
    #[error("Rate limit exceeded for connection {0}")]
    RateLimited(String),

    /// The registry is at its connection limit.
    #[error("Maximum connections ({0}) reached")]
    Capacity(usize),

    /// A channel pattern could not be parsed.
    #[error("Invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// No connection is registered under this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection is registered in the other delivery mode.
    #[error("Connection {0} is registered in push mode")]
    ModeMismatch(String),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bus has been shut down, or no async runtime is available.
    #[error("Event bus is not running")]
    NotRunning,
}

impl From<UnknownVariant> for BusError {
    fn from(err: UnknownVariant) -> Self {
        BusError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::EventType;

    #[test]
    fn test_unknown_variant_is_validation() {
        let err: BusError = "explode".parse::<EventType>().unwrap_err().into();
        assert_eq!(
            err,
            BusError::Validation("unknown event type: \"explode\"".to_string())
        );
    }
}
