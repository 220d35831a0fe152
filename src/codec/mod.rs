//! Protobuf codec for chat messages.
//!
//! The wire record is the `chat.ChatMessage` protobuf message:
//!
//! ```text
//! message ChatMessage {
//!     string user = 1;
//!     string text = 2;
//! }
//! ```
//!
//! Encoding and decoding are pure; framing is left to the WebSocket layer,
//! which guarantees one record per binary frame.

use prost::Message;

use crate::error::DecodeError;

/// A single chat record as carried on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct ChatMessage {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, tag = "2")]
    pub text: String,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }
}

/// Parse a binary payload into a [`ChatMessage`].
pub fn decode(bytes: &[u8]) -> Result<ChatMessage, DecodeError> {
    Ok(ChatMessage::decode(bytes)?)
}

/// Like [`decode`], but rejects payloads longer than `limit` without parsing them.
pub fn decode_bounded(bytes: &[u8], limit: usize) -> Result<ChatMessage, DecodeError> {
    if bytes.len() > limit {
        return Err(DecodeError::TooLarge {
            len: bytes.len(),
            limit,
        });
    }
    decode(bytes)
}

/// Serialize a [`ChatMessage`]. Output is fully materialized before it is
/// handed to the transport, so a frame is never sent half-encoded.
pub fn encode(message: &ChatMessage) -> Vec<u8> {
    message.encode_to_vec()
}
