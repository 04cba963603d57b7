//! # tandem-transport
//!
//! Push transports for the Tandem event engine.
//!
//! Each transport implements [`tandem_core::PushSink`], so the bus drives
//! every stream the same way:
//!
//! - **WebSocket** - Bidirectional; clients acknowledge heartbeats
//! - **SSE** - One-way `text/event-stream`; works through most proxies
//!
//! ```rust,ignore
//! use tandem_core::SubscribeRequest;
//! use tandem_transport::sse_channel;
//!
//! let (sink, messages) = sse_channel(100);
//! bus.subscribe(SubscribeRequest::new("browser-1", ["note:*"]), sink)?;
//! // Serve `messages` as the response body.
//! ```

pub mod sse;
pub mod websocket;

pub use sse::{into_event_stream, sse_channel, SseSink};
pub use websocket::{WebSocketSink, WireFormat};
