//! Frame types for the push stream.
//!
//! A push stream starts with [`Frame::Connected`], then carries
//! [`Frame::Event`] and periodic [`Frame::Heartbeat`] frames. Clients answer
//! heartbeats with [`Frame::Ack`] and may change their subscription with
//! [`Frame::Subscribe`] / [`Frame::Unsubscribe`] on bidirectional transports.

use crate::event::{Event, EventId};
use serde::{Deserialize, Serialize};

/// Current protocol version, sent in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Reconnect delay suggested to clients, in milliseconds.
pub const DEFAULT_RETRY_MS: u32 = 5_000;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const INVALID_FRAME: u16 = 1001;
    /// A channel pattern was rejected.
    pub const INVALID_PATTERN: u16 = 1002;
    /// The connection limit was reached.
    pub const CAPACITY: u16 = 1003;
    /// The connection is rate limited.
    pub const RATE_LIMITED: u16 = 1004;
    /// Anything else.
    pub const INTERNAL: u16 = 1500;
}

/// Frame discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connected,
    Event,
    Heartbeat,
    Ack,
    Subscribe,
    Unsubscribe,
    Error,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake sent by the server when a push stream opens.
    Connected {
        /// Connection identifier (reuse it to reconnect).
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Subscribed channel patterns.
        channels: Vec<String>,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
        /// Number of history events replayed before live delivery.
        replayed: usize,
        /// Suggested reconnect delay in milliseconds.
        retry: u32,
    },

    /// A published event.
    Event {
        /// The event record.
        event: Event,
    },

    /// Liveness check; clients answer with [`Frame::Ack`].
    Heartbeat {
        /// Sequence number of this heartbeat on the stream.
        seq: u64,
        /// Server time in milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Client acknowledgement of a heartbeat and/or delivered events.
    Ack {
        /// Heartbeat sequence being acknowledged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Last event id the client processed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<EventId>,
    },

    /// Replace the subscription of the sending connection.
    Subscribe {
        /// Request id echoed in errors.
        id: u64,
        /// Channel patterns.
        channels: Vec<String>,
    },

    /// Drop the subscription and close the stream.
    Unsubscribe {
        /// Request id.
        id: u64,
    },

    /// Error report.
    Error {
        /// Id of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable message.
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Event { .. } => FrameType::Event,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Name used as the SSE `event:` field.
    ///
    /// Event frames are named after their event type so browser clients can
    /// attach per-type listeners.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Connected { .. } => "connection",
            Frame::Event { event } => event.event_type.as_str(),
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::Ack { .. } => "ack",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Error { .. } => "error",
        }
    }

    /// Id to use for client-side resume, if this frame has one.
    #[must_use]
    pub fn resume_id(&self) -> Option<EventId> {
        match self {
            Frame::Event { event } => Some(event.id),
            _ => None,
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        channels: Vec<String>,
        heartbeat_ms: u32,
        replayed: usize,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            channels,
            heartbeat: heartbeat_ms,
            replayed,
            retry: DEFAULT_RETRY_MS,
        }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(event: Event) -> Self {
        Frame::Event { event }
    }

    /// Create a Heartbeat frame.
    #[must_use]
    pub fn heartbeat(seq: u64, timestamp: u64) -> Self {
        Frame::Heartbeat { seq, timestamp }
    }

    /// Create an Ack frame for a heartbeat.
    #[must_use]
    pub fn ack(seq: u64) -> Self {
        Frame::Ack {
            seq: Some(seq),
            cursor: None,
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, EventType, Priority, Source};

    fn event(id: EventId) -> Event {
        Event {
            id,
            event_type: EventType::Update,
            source: Source::Ui,
            target: "task".into(),
            action: "update_task".into(),
            data: Default::default(),
            metadata: EventMetadata::default(),
            priority: Priority::Normal,
            timestamp: 0,
            ttl: None,
        }
    }

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::heartbeat(1, 0).frame_type(), FrameType::Heartbeat);
        assert_eq!(Frame::event(event(1)).frame_type(), FrameType::Event);
        assert_eq!(Frame::ack(3).frame_type(), FrameType::Ack);
    }

    #[test]
    fn test_frame_names() {
        assert_eq!(Frame::event(event(1)).name(), "update");
        assert_eq!(Frame::connected("c", vec![], 30_000, 0).name(), "connection");
        assert_eq!(Frame::error(0, codes::INTERNAL, "x").name(), "error");
    }

    #[test]
    fn test_event_frame_keeps_type_field() {
        let value = serde_json::to_value(Frame::event(event(9))).unwrap();
        assert_eq!(value["frame"], "event");
        assert_eq!(value["event"]["type"], "update");
        assert_eq!(Frame::event(event(9)).resume_id(), Some(9));
    }

    #[test]
    fn test_ack_from_client_json() {
        let frame: Frame = serde_json::from_str(r#"{"frame":"ack","seq":4}"#).unwrap();
        assert_eq!(frame, Frame::ack(4));
    }
}
