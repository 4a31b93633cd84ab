//! Wire format of the messages exchanged between the two devices.
//!
//! Each message is a JSON object carrying only a `type` tag:
//! `{"type":"ready"}`, `{"type":"start"}` or `{"type":"stop"}`.
//! Unknown tags are tolerated so newer peers can extend the protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    /// StartLine armed a new attempt
    Ready,
    /// Start instant reached on the StartLine
    Start,
    /// Either side ended the attempt
    Stop,
}

/// Decoding shape that accepts any `type` value
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Ready,
    Start,
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed protocol message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolMessage {
    pub fn encode(&self) -> String {
        match self {
            ProtocolMessage::Ready => r#"{"type":"ready"}"#,
            ProtocolMessage::Start => r#"{"type":"start"}"#,
            ProtocolMessage::Stop => r#"{"type":"stop"}"#,
        }
        .to_string()
    }

    /// Decode one frame. Returns `Ok(None)` for a well-formed message with a
    /// type this build does not know.
    pub fn decode(frame: &str) -> Result<Option<Self>, DecodeError> {
        let wire: WireMessage = serde_json::from_str(frame)?;
        Ok(match wire {
            WireMessage::Ready => Some(ProtocolMessage::Ready),
            WireMessage::Start => Some(ProtocolMessage::Start),
            WireMessage::Stop => Some(ProtocolMessage::Stop),
            WireMessage::Unknown => None,
        })
    }
}
