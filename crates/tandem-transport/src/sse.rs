//! Server-Sent Events push sink.
//!
//! [`sse_channel`] returns a sink for the bus and a stream for the HTTP
//! response. The two are joined by a bounded queue: a client that stops
//! reading fills it, and writes then time out and go through the bus's
//! retry schedule. Dropping the stream closes the sink.

use async_trait::async_trait;
use axum::response::sse;
use futures_util::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tandem_core::{DeliveryError, PushSink};
use tandem_protocol::{Frame, SseMessage};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

/// How long a write may wait for queue space.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bus-facing half of an SSE response.
#[derive(Debug)]
pub struct SseSink {
    tx: mpsc::Sender<SseMessage>,
}

/// Create a connected sink and message stream holding up to `buffer` messages.
#[must_use]
pub fn sse_channel(buffer: usize) -> (SseSink, ReceiverStream<SseMessage>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (SseSink { tx }, ReceiverStream::new(rx))
}

#[async_trait]
impl PushSink for SseSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), DeliveryError> {
        let message = SseMessage::from_frame(frame).map_err(|e| DeliveryError::Failed(e.to_string()))?;
        self.tx
            .send_timeout(message, WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Convert a message into an axum SSE event.
///
/// An id that cannot be framed (it holds a line break or NUL) is left out.
#[must_use]
pub fn to_axum_event(message: SseMessage) -> sse::Event {
    let mut event = sse::Event::default().event(message.event).data(message.data);
    match message.id {
        Some(id) if id.contains(['\n', '\r', '\0']) => {
            warn!(id = ?id, "Dropping unframeable SSE id");
        }
        Some(id) => event = event.id(id),
        None => {}
    }
    if let Some(retry) = message.retry {
        event = event.retry(Duration::from_millis(u64::from(retry)));
    }
    event
}

/// Adapt a message stream for `axum::response::Sse`.
pub fn into_event_stream(
    messages: ReceiverStream<SseMessage>,
) -> impl Stream<Item = Result<sse::Event, Infallible>> {
    messages.map(|message| Ok(to_axum_event(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_as_messages() {
        let (mut sink, mut stream) = sse_channel(4);
        sink.send(&Frame::connected("conn_1", vec!["*".into()], 30_000, 0))
            .await
            .unwrap();
        sink.send(&Frame::heartbeat(1, 5)).await.unwrap();

        let hello = stream.next().await.unwrap();
        assert_eq!(hello.id.as_deref(), Some("conn_1"));
        assert_eq!(hello.event, "connection");
        assert_eq!(hello.retry, Some(5_000));

        let heartbeat = stream.next().await.unwrap();
        assert_eq!(heartbeat.event, "heartbeat");
        assert!(heartbeat.id.is_none());
    }

    #[test]
    fn test_unframeable_id_is_dropped() {
        let message = SseMessage::from_frame(&Frame::connected("a\nb", vec!["*".into()], 30_000, 0))
            .unwrap();
        let event = to_axum_event(message);
        assert!(!format!("{event:?}").contains("id: a"));

        let message = SseMessage::from_frame(&Frame::connected("conn_1", vec!["*".into()], 30_000, 0))
            .unwrap();
        to_axum_event(message);
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_sink() {
        let (mut sink, stream) = sse_channel(4);
        drop(stream);
        assert_eq!(
            sink.send(&Frame::heartbeat(1, 0)).await.unwrap_err(),
            DeliveryError::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out() {
        let (mut sink, _stream) = sse_channel(1);
        sink.send(&Frame::heartbeat(1, 0)).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(
            sink.send(&Frame::heartbeat(2, 0)).await.unwrap_err(),
            DeliveryError::Timeout
        );
        assert_eq!(started.elapsed(), WRITE_TIMEOUT);
    }
}
