//! One-round identity exchange over an established transport connection.
//!
//! Each side sends a single UTF-8 JSON object:
//! `{"type":"request","peer_id":"…","metadata":{…}}` answered by
//! `{"type":"response","peer_id":"…","metadata":{…}}`. The handshake
//! identifies but does not authenticate; a keyed variant can replace it
//! without touching any other component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Handshake failure modes.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("unexpected handshake message type")]
    Unexpected,
}

/// The two handshake payloads, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeMessage {
    Request {
        peer_id: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    Response {
        peer_id: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
}

impl HandshakeMessage {
    pub fn request(peer_id: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        HandshakeMessage::Request {
            peer_id: peer_id.into(),
            metadata,
        }
    }

    pub fn response(peer_id: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        HandshakeMessage::Response {
            peer_id: peer_id.into(),
            metadata,
        }
    }

    /// The claimed identity of the sender.
    pub fn peer_id(&self) -> &str {
        match self {
            HandshakeMessage::Request { peer_id, .. } => peer_id,
            HandshakeMessage::Response { peer_id, .. } => peer_id,
        }
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        match self {
            HandshakeMessage::Request { metadata, .. } => metadata,
            HandshakeMessage::Response { metadata, .. } => metadata,
        }
    }

    /// Serialize as one JSON object.
    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    /// Parse one JSON object; unknown `type` values and non-JSON input are
    /// `Malformed`.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        serde_json::from_slice(bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}
