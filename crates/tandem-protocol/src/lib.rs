//! # tandem-protocol
//!
//! Wire records for the tandem event engine.
//!
//! Every transport (long-poll JSON bodies, Server-Sent Events, WebSocket)
//! carries the same [`Event`] record. Push transports wrap events in
//! [`Frame`]s together with the handshake and heartbeats.
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{codec, Frame};
//!
//! let frame = Frame::heartbeat(1, 1_700_000_000_000);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;
pub mod sse;

pub use codec::{decode, encode, ProtocolError};
pub use event::{Event, EventId, EventMetadata, EventType, Payload, Priority, Source, UnknownVariant};
pub use frames::{codes, Frame, FrameType, PROTOCOL_VERSION};
pub use sse::SseMessage;
