//! JSON codec for chat messages.
//!
//! The same encoding is used on client sockets and on the broker topic, so a
//! published payload can be handed to local clients without re-encoding.

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;

use crate::message::{Message, Origin};

/// Default cap on an inbound socket frame, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Errors raised while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured size cap.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Payload is not a JSON message.
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Encode a message for a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_text(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a message from JSON bytes.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON message object.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Decode a message, rejecting payloads larger than `max` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] or a JSON error.
pub fn decode_limited(data: &[u8], max: usize) -> Result<Message, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }
    decode(data)
}

/// Turn a raw client frame into a publishable message.
///
/// Decodes `data`, overwrites sender, channel and timestamp from `origin`,
/// and re-encodes. Returns both forms.
///
/// # Errors
///
/// Returns an error if the frame is oversized or not a JSON message.
pub fn ingest(data: &[u8], origin: &Origin, max: usize) -> Result<(Message, Bytes), ProtocolError> {
    let mut message = decode_limited(data, max)?;
    message.stamp(origin, Utc::now());
    let encoded = encode(&message)?;
    Ok((message, encoded))
}
