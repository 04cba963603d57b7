//! Codecs for encoding and decoding frames.
//!
//! Binary transports use MessagePack with a 4-byte big-endian length prefix.
//! Text transports (WebSocket text messages, long-poll bodies) use JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame to length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let length = match frame_length(data)? {
        Some(length) => length,
        None => return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len())),
    };

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` when more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(length) = frame_length(buf)? else {
        return Ok(None);
    };

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

fn frame_length(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(length))
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns an error if serialization fails or the text exceeds [`MAX_FRAME_SIZE`].
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
