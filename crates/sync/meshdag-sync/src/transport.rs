//! The pluggable byte-transport seam.
//!
//! A transport delivers whole messages (length-prefix framing is the
//! implementer's job when the medium is a byte stream, see
//! [`crate::framing`]), at most once per send, ordered within a single
//! device connection but not across devices.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

/// Capacity of a transport's incoming-bytes channel; the natural
/// backpressure point for slow consumers.
pub const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// Transport failure modes.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send to {0} failed: {1}")]
    SendFailed(String, String),
    #[error("device not reachable: {0}")]
    Unreachable(String),
    #[error("transport operation timed out")]
    Timeout,
    #[error("transport is shut down")]
    Shutdown,
    #[error("incoming sequence was already taken")]
    IncomingTaken,
}

/// A transport-layer handle to a reachable endpoint. Identity lives one
/// layer up: several devices may answer for the same peer, learned via
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDevice {
    /// Opaque protocol-scoped address.
    pub address: String,
    pub display_name: String,
    /// Tag of the transport protocol that produced this handle.
    pub protocol: String,
    pub connected_at: DateTime<Utc>,
    pub is_active: bool,
    pub metadata: HashMap<String, String>,
}

impl TransportDevice {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            protocol: protocol.into(),
            connected_at: Utc::now(),
            is_active: true,
            metadata: HashMap::new(),
        }
    }
}

/// One received transport message with its origin and arrival time.
#[derive(Debug, Clone)]
pub struct IncomingBytes {
    pub device: TransportDevice,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Byte-level send/receive plus device discovery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the transport up. Must be called before any other operation.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Tear the transport down; pending sends may be dropped.
    async fn shutdown(&self) -> Result<(), TransportError>;

    /// Enumerate currently reachable devices.
    async fn discover_devices(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<TransportDevice>, TransportError>;

    /// Deliver one message to one device, at most once.
    async fn send_bytes(
        &self,
        device: &TransportDevice,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), TransportError>;

    /// The incoming-bytes sequence. Handed out exactly once; the consumer
    /// owns the receive loop and cancellation propagates through channel
    /// close.
    async fn incoming(&self) -> Result<mpsc::Receiver<IncomingBytes>, TransportError>;

    /// Cheap liveness probe.
    async fn is_peer_reachable(&self, device: &TransportDevice) -> Result<bool, TransportError>;
}

struct HubEntry {
    device: TransportDevice,
    sender: mpsc::Sender<IncomingBytes>,
}

/// Shared routing fabric for [`MemoryTransport`] instances: a map from
/// address to the owning transport's incoming channel.
#[derive(Clone, Default)]
pub struct MemoryHub {
    entries: Arc<RwLock<HashMap<String, HubEntry>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, device: TransportDevice, sender: mpsc::Sender<IncomingBytes>) {
        self.entries
            .write()
            .await
            .insert(device.address.clone(), HubEntry { device, sender });
    }

    async fn unregister(&self, address: &str) {
        self.entries.write().await.remove(address);
    }

    async fn devices_except(&self, address: &str) -> Vec<TransportDevice> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.device.address != address)
            .map(|entry| entry.device.clone())
            .collect()
    }

    async fn sender_for(&self, address: &str) -> Option<mpsc::Sender<IncomingBytes>> {
        self.entries
            .read()
            .await
            .get(address)
            .map(|entry| entry.sender.clone())
    }

    async fn contains(&self, address: &str) -> bool {
        self.entries.read().await.contains_key(address)
    }
}

/// In-process [`Transport`] wired through a [`MemoryHub`], for tests and
/// examples. Boundaries are inherently preserved; no framing needed.
pub struct MemoryTransport {
    hub: MemoryHub,
    device: TransportDevice,
    sender: mpsc::Sender<IncomingBytes>,
    receiver: Mutex<Option<mpsc::Receiver<IncomingBytes>>>,
}

impl MemoryTransport {
    pub fn new(hub: &MemoryHub, address: impl Into<String>, display_name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        Self {
            hub: hub.clone(),
            device: TransportDevice::new(address, display_name, "memory"),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// The device handle other transports see for this endpoint.
    pub fn device(&self) -> TransportDevice {
        self.device.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        self.hub
            .register(self.device.clone(), self.sender.clone())
            .await;
        debug!(address = %self.device.address, "memory transport registered");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.hub.unregister(&self.device.address).await;
        Ok(())
    }

    async fn discover_devices(
        &self,
        _timeout: Option<Duration>,
    ) -> Result<Vec<TransportDevice>, TransportError> {
        Ok(self.hub.devices_except(&self.device.address).await)
    }

    async fn send_bytes(
        &self,
        device: &TransportDevice,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let sender = self
            .hub
            .sender_for(&device.address)
            .await
            .ok_or_else(|| TransportError::Unreachable(device.address.clone()))?;
        let message = IncomingBytes {
            device: self.device.clone(),
            bytes: bytes.to_vec(),
            received_at: Utc::now(),
        };
        let delivery = sender.send(message);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, delivery)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => delivery.await,
        }
        .map_err(|_| TransportError::SendFailed(device.address.clone(), "channel closed".to_string()))
    }

    async fn incoming(&self) -> Result<mpsc::Receiver<IncomingBytes>, TransportError> {
        self.receiver
            .lock()
            .await
            .take()
            .ok_or(TransportError::IncomingTaken)
    }

    async fn is_peer_reachable(&self, device: &TransportDevice) -> Result<bool, TransportError> {
        Ok(self.hub.contains(&device.address).await)
    }
}
