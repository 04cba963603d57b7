//! WebSocket push sink.
//!
//! Generic over the outbound half of any WebSocket implementation, so the
//! same sink serves axum's `SplitSink<WebSocket, Message>` and in-memory
//! sinks in tests. Clones share the underlying socket; the connection
//! handler keeps one to answer client frames while the bus owns another.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{DeliveryError, PushSink};
use tandem_protocol::{codec, Frame, ProtocolError};
use tokio::sync::Mutex;
use tracing::debug;

/// Encoding of outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    MessagePack,
}

impl WireFormat {
    /// Parse a `format` query value. Unknown values fall back to JSON.
    #[must_use]
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("msgpack") | Some("messagepack") => WireFormat::MessagePack,
            _ => WireFormat::Json,
        }
    }
}

/// Outbound half of a WebSocket connection carrying messages of type `M`.
pub struct WebSocketSink<S, M> {
    inner: Arc<Mutex<S>>,
    format: WireFormat,
    is_open: Arc<AtomicBool>,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> Clone for WebSocketSink<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            format: self.format,
            is_open: Arc::clone(&self.is_open),
            _message: PhantomData,
        }
    }
}

impl<S, M> WebSocketSink<S, M>
where
    S: Sink<M> + Unpin + Send + 'static,
    S::Error: Display,
    M: From<String> + From<Vec<u8>> + Send,
{
    /// Wrap the outbound half of a socket.
    #[must_use]
    pub fn new(sink: S, format: WireFormat) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
            format,
            is_open: Arc::new(AtomicBool::new(true)),
            _message: PhantomData,
        }
    }

    /// Encode and write one frame.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] once the socket is closed, and
    /// [`DeliveryError::Failed`] when encoding or the write fails.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        let message = encode(frame, self.format).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        let mut sink = self.inner.lock().await;
        sink.send(message)
            .await
            .map_err(|e| DeliveryError::Failed(e.to_string()))
    }

    /// Close the socket. Closing twice is a no-op.
    pub async fn shutdown(&self) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.inner.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }

    /// Whether the socket accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Stop accepting writes without closing the socket.
    pub fn mark_closed(&self) {
        self.is_open.store(false, Ordering::SeqCst);
    }
}

fn encode<M: From<String> + From<Vec<u8>>>(frame: &Frame, format: WireFormat) -> Result<M, ProtocolError> {
    Ok(match format {
        WireFormat::Json => M::from(codec::encode_text(frame)?),
        WireFormat::MessagePack => M::from(codec::encode(frame)?.to_vec()),
    })
}

#[async_trait]
impl<S, M> PushSink for WebSocketSink<S, M>
where
    S: Sink<M> + Unpin + Send + 'static,
    S::Error: Display,
    M: From<String> + From<Vec<u8>> + Send + 'static,
{
    async fn send(&mut self, frame: &Frame) -> Result<(), DeliveryError> {
        self.send_frame(frame).await
    }

    fn acknowledges(&self) -> bool {
        true
    }
}

/// Decode an inbound text message.
///
/// # Errors
///
/// Returns an error if the text is not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    codec::decode_text(text)
}

/// Decode an inbound binary message.
///
/// # Errors
///
/// Returns an error if the bytes are not a complete, valid frame.
pub fn decode_binary(data: &[u8]) -> Result<Frame, ProtocolError> {
    codec::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::FrameType;

    #[derive(Debug, PartialEq)]
    enum TestMessage {
        Text(String),
        Binary(Vec<u8>),
    }

    impl From<String> for TestMessage {
        fn from(text: String) -> Self {
            TestMessage::Text(text)
        }
    }

    impl From<Vec<u8>> for TestMessage {
        fn from(data: Vec<u8>) -> Self {
            TestMessage::Binary(data)
        }
    }

    #[tokio::test]
    async fn test_json_frames() {
        let sink = WebSocketSink::<_, TestMessage>::new(Vec::<TestMessage>::new(), WireFormat::Json);
        sink.send_frame(&Frame::heartbeat(1, 42)).await.unwrap();

        let written = sink.inner.lock().await;
        match &written[0] {
            TestMessage::Text(text) => {
                assert_eq!(decode_text(text).unwrap(), Frame::heartbeat(1, 42));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_msgpack_frames() {
        let mut sink = WebSocketSink::<_, TestMessage>::new(Vec::<TestMessage>::new(), WireFormat::MessagePack);
        PushSink::send(&mut sink, &Frame::ack(3)).await.unwrap();

        let written = sink.inner.lock().await;
        match &written[0] {
            TestMessage::Binary(data) => {
                assert_eq!(decode_binary(data).unwrap().frame_type(), FrameType::Ack);
            }
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_writes() {
        let sink = WebSocketSink::<_, TestMessage>::new(Vec::<TestMessage>::new(), WireFormat::Json);
        let handle = sink.clone();
        handle.shutdown().await;
        handle.shutdown().await;

        assert!(!sink.is_open());
        assert_eq!(
            sink.send_frame(&Frame::heartbeat(1, 0)).await.unwrap_err(),
            DeliveryError::Closed
        );
    }

    #[test]
    fn test_wire_format_query() {
        assert_eq!(WireFormat::from_query(None), WireFormat::Json);
        assert_eq!(WireFormat::from_query(Some("msgpack")), WireFormat::MessagePack);
        assert_eq!(WireFormat::from_query(Some("xml")), WireFormat::Json);
    }
}
