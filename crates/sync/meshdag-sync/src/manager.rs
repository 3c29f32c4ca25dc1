//! Peer lifecycle: turn raw device events from the transport into
//! peer-level events.
//!
//! Per device address the manager runs a small state machine:
//! Discovered → AwaitingHandshake → Connected, with Failed on handshake
//! timeout or protocol violation and Disconnected on device loss.
//! Identity is learned through the JSON handshake; once a device is
//! bound, its bytes decode as sync messages and are routed onward.

use crate::handshake::{HandshakeError, HandshakeMessage};
use crate::messages::{SyncMessage, WireError};
use crate::peer::{Peer, PeerEvent};
use crate::transport::{IncomingBytes, Transport, TransportDevice, TransportError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors raised by peer-manager operations.
#[derive(Error, Debug)]
pub enum PeerManagerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("protocol violation from {address}: {reason}")]
    Protocol { address: String, reason: String },
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("peer is not connected: {0}")]
    NotConnected(String),
    #[error("connection limit reached")]
    AtCapacity,
}

/// Tunables for discovery, handshaking and reconnection.
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Move newly discovered devices straight to handshaking.
    pub auto_connect: bool,
    /// Upper bound on concurrently connected devices; excess discoveries
    /// stay in `Discovered` until capacity frees.
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub discovery_interval: Duration,
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            max_connections: 8,
            handshake_timeout: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

impl PeerManagerConfig {
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

/// Counters over manager activity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerManagerStats {
    pub broadcasts: u64,
    pub broadcast_failures: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
}

/// A decoded sync message attributed to a connected peer, ready for the
/// synchronizer.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub peer_id: String,
    pub device: TransportDevice,
    pub message: SyncMessage,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Discovered,
    AwaitingHandshake,
    Connected,
    Failed,
    Disconnected,
}

#[derive(Debug)]
struct DeviceEntry {
    device: TransportDevice,
    state: DeviceState,
    handshake_deadline: Option<Instant>,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl DeviceEntry {
    fn new(device: TransportDevice, state: DeviceState) -> Self {
        Self {
            device,
            state,
            handshake_deadline: None,
            attempts: 0,
            retry_at: None,
        }
    }
}

#[derive(Default)]
struct ManagerInner {
    devices: HashMap<String, DeviceEntry>,
    address_to_peer: HashMap<String, String>,
    peers: HashMap<String, Peer>,
    last_activity: HashMap<String, DateTime<Utc>>,
    stats: PeerManagerStats,
}

impl ManagerInner {
    fn connected_count(&self) -> usize {
        self.devices
            .values()
            .filter(|entry| entry.state == DeviceState::Connected)
            .count()
    }
}

/// Discovery → handshake → peer lifecycle over one transport.
pub struct PeerManager {
    transport: Arc<dyn Transport>,
    config: PeerManagerConfig,
    local_peer_id: String,
    local_metadata: HashMap<String, String>,
    inner: Arc<RwLock<ManagerInner>>,
    events: broadcast::Sender<PeerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_peer_id: impl Into<String>,
        config: PeerManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            transport,
            config,
            local_peer_id: local_peer_id.into(),
            local_metadata: HashMap::new(),
            inner: Arc::new(RwLock::new(ManagerInner::default())),
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Metadata advertised in outgoing handshakes.
    pub fn with_local_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.local_metadata = metadata;
        self
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Subscribe to peer-lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> PeerManagerStats {
        self.inner.read().await.stats
    }

    /// Peers whose device is currently connected.
    pub async fn connected_peers(&self) -> Vec<Peer> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter(|peer| peer.is_active)
            .cloned()
            .collect()
    }

    /// Look up any known peer, connected or offline.
    pub async fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner.read().await.peers.get(peer_id).cloned()
    }

    /// Latest activity timestamp for a peer.
    pub async fn last_activity(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_activity.get(peer_id).copied()
    }

    fn emit(&self, event: PeerEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Begin a handshake toward `device`, honoring the connection cap.
    pub async fn connect(&self, device: &TransportDevice) -> Result<(), PeerManagerError> {
        {
            let mut inner = self.inner.write().await;
            if inner.connected_count() >= self.config.max_connections {
                return Err(PeerManagerError::AtCapacity);
            }
            let entry = inner
                .devices
                .entry(device.address.clone())
                .or_insert_with(|| DeviceEntry::new(device.clone(), DeviceState::Discovered));
            if entry.state == DeviceState::Connected {
                return Ok(());
            }
            entry.state = DeviceState::AwaitingHandshake;
            entry.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
        }

        let request =
            HandshakeMessage::request(self.local_peer_id.clone(), self.local_metadata.clone());
        let bytes = request.encode()?;
        debug!(address = %device.address, "initiating handshake");
        if let Err(e) = self
            .transport
            .send_bytes(device, &bytes, Some(self.config.handshake_timeout))
            .await
        {
            self.fail_device(&device.address).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Route one transport message through the device state machine.
    /// Handshake traffic is absorbed; sync traffic from connected devices
    /// comes back as a [`RoutedMessage`].
    pub async fn handle_incoming(
        &self,
        incoming: IncomingBytes,
    ) -> Result<Option<RoutedMessage>, PeerManagerError> {
        let address = incoming.device.address.clone();
        let known_state = {
            let inner = self.inner.read().await;
            inner.devices.get(&address).map(|entry| entry.state)
        };
        let state = match known_state {
            Some(state) => state,
            None => {
                // first contact from an unknown address: the bytes in
                // hand are almost certainly its handshake
                let mut entry =
                    DeviceEntry::new(incoming.device.clone(), DeviceState::AwaitingHandshake);
                entry.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
                self.inner
                    .write()
                    .await
                    .devices
                    .entry(address.clone())
                    .or_insert(entry);
                self.emit(PeerEvent::Discovered(incoming.device.clone()));
                DeviceState::AwaitingHandshake
            }
        };

        match state {
            DeviceState::Connected => self.route_sync(incoming).await.map(Some),
            _ => {
                self.handle_handshake_bytes(state, incoming).await?;
                Ok(None)
            }
        }
    }

    async fn route_sync(&self, incoming: IncomingBytes) -> Result<RoutedMessage, PeerManagerError> {
        let address = incoming.device.address.clone();
        let message = match SyncMessage::decode(&incoming.bytes) {
            Ok(message) => message,
            Err(WireError::Malformed(reason)) => {
                warn!(%address, %reason, "undecodable bytes from connected device");
                self.fail_device(&address).await;
                return Err(PeerManagerError::Protocol { address, reason });
            }
        };
        let mut inner = self.inner.write().await;
        let peer_id = inner
            .address_to_peer
            .get(&address)
            .cloned()
            .ok_or_else(|| PeerManagerError::UnknownPeer(address.clone()))?;
        inner.last_activity.insert(peer_id.clone(), incoming.received_at);
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.last_seen = incoming.received_at;
        }
        Ok(RoutedMessage {
            peer_id,
            device: incoming.device,
            message,
            received_at: incoming.received_at,
        })
    }

    async fn handle_handshake_bytes(
        &self,
        state: DeviceState,
        incoming: IncomingBytes,
    ) -> Result<(), PeerManagerError> {
        let address = incoming.device.address.clone();
        let message = match HandshakeMessage::decode(&incoming.bytes) {
            Ok(message) => message,
            Err(e) => {
                self.fail_device(&address).await;
                return Err(e.into());
            }
        };
        match message {
            HandshakeMessage::Request { peer_id, metadata } => {
                let response = HandshakeMessage::response(
                    self.local_peer_id.clone(),
                    self.local_metadata.clone(),
                );
                let bytes = response.encode()?;
                if let Err(e) = self
                    .transport
                    .send_bytes(&incoming.device, &bytes, Some(self.config.handshake_timeout))
                    .await
                {
                    self.fail_device(&address).await;
                    return Err(e.into());
                }
                self.bind_peer(incoming.device, peer_id, metadata).await;
                Ok(())
            }
            HandshakeMessage::Response { peer_id, metadata } => {
                if state != DeviceState::AwaitingHandshake {
                    self.fail_device(&address).await;
                    return Err(HandshakeError::Unexpected.into());
                }
                self.bind_peer(incoming.device, peer_id, metadata).await;
                Ok(())
            }
        }
    }

    /// Handshake success: bind the address to the claimed identity and go
    /// Connected.
    async fn bind_peer(
        &self,
        device: TransportDevice,
        peer_id: String,
        metadata: HashMap<String, String>,
    ) {
        let peer = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .devices
                .entry(device.address.clone())
                .or_insert_with(|| DeviceEntry::new(device.clone(), DeviceState::Discovered));
            entry.state = DeviceState::Connected;
            entry.handshake_deadline = None;
            entry.attempts = 0;
            entry.retry_at = None;
            inner
                .address_to_peer
                .insert(device.address.clone(), peer_id.clone());
            let now = Utc::now();
            inner.last_activity.insert(peer_id.clone(), now);
            let peer = inner
                .peers
                .entry(peer_id.clone())
                .and_modify(|peer| {
                    peer.device = device.clone();
                    peer.metadata = metadata.clone();
                    peer.last_seen = now;
                    peer.is_active = true;
                })
                .or_insert_with(|| Peer::new(peer_id.clone(), device.clone(), metadata.clone()))
                .clone();
            inner.stats.handshakes_completed += 1;
            peer
        };
        debug!(peer_id = %peer.peer_id, address = %peer.device.address, "peer connected");
        self.emit(PeerEvent::Connected(peer));
    }

    /// Handshake failure or protocol violation: drop the binding and
    /// schedule a retry slot.
    async fn fail_device(&self, address: &str) {
        {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.devices.get_mut(address) else {
                return;
            };
            entry.state = DeviceState::Failed;
            entry.handshake_deadline = None;
            entry.attempts += 1;
            entry.retry_at = Some(Instant::now() + self.config.reconnect_delay);
            inner.stats.handshakes_failed += 1;
        }
        self.emit(PeerEvent::Failed {
            address: address.to_string(),
        });
    }

    /// Device loss: the peer record is retained offline.
    async fn device_lost(&self, address: &str) {
        let peer_id = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;
            let Some(entry) = inner.devices.get_mut(address) else {
                return;
            };
            if entry.state != DeviceState::Connected {
                return;
            }
            entry.state = DeviceState::Disconnected;
            let peer_id = inner.address_to_peer.get(address).cloned();
            if let Some(peer_id) = &peer_id {
                if let Some(peer) = inner.peers.get_mut(peer_id) {
                    peer.is_active = false;
                }
            }
            peer_id
        };
        if let Some(peer_id) = peer_id {
            debug!(%peer_id, %address, "peer disconnected");
            self.emit(PeerEvent::Disconnected(peer_id));
        }
    }

    /// Encode once and send to every connected device, best-effort.
    /// Returns how many sends succeeded; failures are recorded in stats
    /// and the failing device transitions to Disconnected.
    pub async fn broadcast(&self, message: &SyncMessage) -> usize {
        let bytes = message.encode();
        let targets: Vec<TransportDevice> = {
            let inner = self.inner.read().await;
            inner
                .devices
                .values()
                .filter(|entry| entry.state == DeviceState::Connected)
                .map(|entry| entry.device.clone())
                .collect()
        };
        let mut delivered = 0;
        let mut failures = 0;
        for device in &targets {
            match self.transport.send_bytes(device, &bytes, None).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(address = %device.address, error = %e, "broadcast send failed");
                    failures += 1;
                    self.device_lost(&device.address).await;
                }
            }
        }
        let mut inner = self.inner.write().await;
        inner.stats.broadcasts += 1;
        inner.stats.broadcast_failures += failures;
        delivered
    }

    /// Send one message to one connected peer.
    pub async fn send_to_peer(
        &self,
        peer_id: &str,
        message: &SyncMessage,
    ) -> Result<(), PeerManagerError> {
        let device = {
            let inner = self.inner.read().await;
            let peer = inner
                .peers
                .get(peer_id)
                .ok_or_else(|| PeerManagerError::UnknownPeer(peer_id.to_string()))?;
            if !peer.is_active {
                return Err(PeerManagerError::NotConnected(peer_id.to_string()));
            }
            peer.device.clone()
        };
        if let Err(e) = self
            .transport
            .send_bytes(&device, &message.encode(), None)
            .await
        {
            self.device_lost(&device.address).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// One discovery round: enumerate devices and feed them through the
    /// auto-connect policy.
    pub async fn discover_now(&self) -> Result<Vec<TransportDevice>, PeerManagerError> {
        let devices = self.transport.discover_devices(None).await?;
        let mut to_connect = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let capacity = self
                .config
                .max_connections
                .saturating_sub(inner.connected_count());
            let mut slots = capacity;
            for device in &devices {
                let known = inner.devices.contains_key(&device.address);
                let entry = inner
                    .devices
                    .entry(device.address.clone())
                    .or_insert_with(|| DeviceEntry::new(device.clone(), DeviceState::Discovered));
                if !known {
                    self.emit(PeerEvent::Discovered(device.clone()));
                }
                let eligible = match entry.state {
                    DeviceState::Discovered => self.config.auto_connect,
                    // rediscovered after loss: re-handshake
                    DeviceState::Disconnected => true,
                    _ => false,
                };
                if eligible && slots > 0 {
                    slots -= 1;
                    to_connect.push(device.clone());
                }
            }
        }
        for device in to_connect {
            if let Err(e) = self.connect(&device).await {
                debug!(address = %device.address, error = %e, "auto-connect attempt failed");
            }
        }
        Ok(devices)
    }

    /// Expire overdue handshakes, retry failed devices within their
    /// remaining reconnect attempts, and probe connected devices for
    /// liveness.
    pub async fn run_health_check(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut retry = Vec::new();
        let mut probe = Vec::new();
        {
            let inner = self.inner.read().await;
            for (address, entry) in &inner.devices {
                match entry.state {
                    DeviceState::AwaitingHandshake => {
                        if entry.handshake_deadline.is_some_and(|deadline| now >= deadline) {
                            expired.push(address.clone());
                        }
                    }
                    DeviceState::Failed => {
                        if entry.attempts <= self.config.max_reconnect_attempts
                            && entry.retry_at.is_some_and(|at| now >= at)
                        {
                            retry.push(entry.device.clone());
                        }
                    }
                    DeviceState::Connected => probe.push(entry.device.clone()),
                    _ => {}
                }
            }
        }
        for address in expired {
            warn!(%address, "handshake timed out");
            self.fail_device(&address).await;
        }
        for device in retry {
            if let Err(e) = self.connect(&device).await {
                debug!(address = %device.address, error = %e, "reconnect attempt failed");
            }
        }
        for device in probe {
            match self.transport.is_peer_reachable(&device).await {
                Ok(true) => {}
                Ok(false) | Err(_) => self.device_lost(&device.address).await,
            }
        }
    }

    /// Spawn the discovery and health loops.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let discovery = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.discovery_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = manager.discover_now().await {
                        warn!(error = %e, "discovery round failed");
                    }
                }
            })
        };
        let health = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.health_check_interval);
                loop {
                    ticker.tick().await;
                    manager.run_health_check().await;
                }
            })
        };
        tasks.push(discovery);
        tasks.push(health);
    }

    /// Cancel the background loops.
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.try_lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}
