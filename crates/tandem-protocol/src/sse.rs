//! Server-Sent Events framing.
//!
//! Maps a [`Frame`] onto the SSE fields (`id`, `event`, `retry`, `data`) and
//! renders them in `text/event-stream` format.

use crate::codec::{encode_text, ProtocolError};
use crate::frames::Frame;

/// One SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// Resume id (`Last-Event-ID` on reconnect).
    pub id: Option<String>,
    /// Event name.
    pub event: &'static str,
    /// Reconnect delay in milliseconds.
    pub retry: Option<u32>,
    /// JSON-encoded frame.
    pub data: String,
}

impl SseMessage {
    /// Build the SSE message for a frame.
    ///
    /// Event frames carry their event id so that a reconnecting client resumes
    /// from the last event it saw; the handshake carries the connection id.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let (id, retry) = match frame {
            Frame::Connected {
                connection_id,
                retry,
                ..
            } => (Some(connection_id.clone()), Some(*retry)),
            other => (other.resume_id().map(|id| id.to_string()), None),
        };

        Ok(Self {
            id,
            event: frame.name(),
            retry,
            data: encode_text(frame)?,
        })
    }

    /// Render in `text/event-stream` format, including the blank line terminator.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 64);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str("event: ");
        out.push_str(self.event);
        out.push('\n');
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_render() {
        let msg = SseMessage::from_frame(&Frame::heartbeat(2, 10)).unwrap();
        assert_eq!(msg.id, None);
        assert_eq!(
            msg.render(),
            "event: heartbeat\ndata: {\"frame\":\"heartbeat\",\"seq\":2,\"timestamp\":10}\n\n"
        );
    }

    #[test]
    fn test_connected_carries_retry() {
        let msg =
            SseMessage::from_frame(&Frame::connected("abc", vec!["*".into()], 1_000, 0)).unwrap();
        let text = msg.render();
        assert!(text.starts_with("id: abc\nevent: connection\nretry: 5000\n"));
        assert!(text.ends_with("\n\n"));
    }
}
