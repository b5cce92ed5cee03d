//! Codec for encoding and decoding Murmur messages.
//!
//! Messages travel as JSON, both on bus topics and in HTTP bodies. A poll
//! response is a JSON array of messages.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::message::Message;

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a message from bytes.
///
/// Unknown `type` tags decode successfully; malformed JSON does not.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    Ok(serde_json::from_slice(data)?)
}

/// Encode a batch of messages as a JSON array, as returned by a poll.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_batch(messages: &[Message]) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(messages)?))
}

/// Decode a JSON array of messages.
///
/// # Errors
///
/// Returns an error if the data is not a JSON array of messages.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Serialize a structured body (room lists, member lists, history) to text.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn body_json<T: Serialize + ?Sized>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}
