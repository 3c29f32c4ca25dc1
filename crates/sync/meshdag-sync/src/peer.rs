//! Application-layer peer identity.

use crate::transport::TransportDevice;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A known peer: a stable identity bound to whichever transport device it
/// last answered on. The peer id is globally unique per node, survives
/// reconnection, and is distinct from any transport address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub device: TransportDevice,
    pub metadata: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

impl Peer {
    pub fn new(
        peer_id: impl Into<String>,
        device: TransportDevice,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            device,
            metadata,
            last_seen: Utc::now(),
            is_active: true,
        }
    }
}

/// Peer-lifecycle notifications fanned out by the peer manager.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A new device surfaced from discovery or inbound traffic.
    Discovered(TransportDevice),
    /// Handshake completed; the device is bound to a peer identity.
    Connected(Peer),
    /// The device for this peer dropped; the record is retained offline.
    Disconnected(String),
    /// Handshake failed or the device violated the protocol.
    Failed { address: String },
}
