//! The block-exchange engine: HAVE/WANT/REQ/RESP over the peer manager.

use crate::manager::{PeerManager, PeerManagerError, RoutedMessage};
use crate::messages::SyncMessage;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use meshdag_core_types::{Block, BlockError, Cid};
use meshdag_types::dag::{DagError, MerkleDag};
use meshdag_types::store::{BlockStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long an outbound WANT suppresses repeats toward the same peer.
/// The contract is idempotence within the window, not exactly-once.
const WANT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Errors surfaced by synchronizer operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("synchronizer is disposed")]
    Closed,
    #[error("block {0} failed validation")]
    InvalidBlock(Cid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Peer(#[from] PeerManagerError),
}

/// Synchronizer tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Broadcast HAVE for every locally added block.
    pub announce_new_blocks: bool,
    /// Answer incoming HAVEs with WANTs for the blocks we lack.
    pub auto_request_missing: bool,
    /// Bound on concurrently in-flight outbound requests.
    pub max_concurrent_requests: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            announce_new_blocks: true,
            auto_request_missing: true,
            max_concurrent_requests: 10,
        }
    }
}

impl SyncConfig {
    pub fn with_announce_new_blocks(mut self, announce: bool) -> Self {
        self.announce_new_blocks = announce;
        self
    }

    pub fn with_auto_request_missing(mut self, auto_request: bool) -> Self {
        self.auto_request_missing = auto_request;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }
}

/// Counters over replication activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub total_blocks_received: u64,
    pub total_blocks_sent: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Observable replication events.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer advertised blocks to us.
    BlocksAnnounced { peer_id: String, cids: Vec<Cid> },
    /// A peer asked us for blocks.
    BlocksRequested { peer_id: String, cids: Vec<Cid> },
    /// A block arrived, validated, and was stored.
    BlockReceived { cid: Cid, from_peer: String },
    /// A non-fatal replication failure.
    SyncError {
        peer_id: Option<String>,
        reason: String,
    },
}

struct SyncCore {
    store: Arc<dyn BlockStore>,
    dag: Arc<MerkleDag>,
    manager: Arc<PeerManager>,
    config: SyncConfig,
    stats: RwLock<SyncStats>,
    events: RwLock<Option<broadcast::Sender<SyncEvent>>>,
    requests: Semaphore,
    recent_wants: RwLock<HashMap<String, HashMap<Cid, Instant>>>,
    disposed: AtomicBool,
}

impl SyncCore {
    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    async fn emit(&self, event: SyncEvent) {
        if let Some(sender) = self.events.read().await.as_ref() {
            // nobody listening is fine
            let _ = sender.send(event);
        }
    }

    async fn emit_error(&self, peer_id: Option<String>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(?peer_id, %reason, "sync error");
        self.emit(SyncEvent::SyncError { peer_id, reason }).await;
    }

    async fn touch_sync_time(&self) {
        self.stats.write().await.last_sync_time = Some(Utc::now());
    }

    /// Drop CIDs WANTed from this peer inside the dedup window and record
    /// the survivors.
    async fn filter_recent_wants(&self, peer_id: &str, cids: Vec<Cid>) -> Vec<Cid> {
        let now = Instant::now();
        let mut wants = self.recent_wants.write().await;
        let per_peer = wants.entry(peer_id.to_string()).or_default();
        per_peer.retain(|_, asked| now.duration_since(*asked) < WANT_DEDUP_WINDOW);
        cids.into_iter()
            .filter(|cid| match per_peer.get(cid) {
                Some(_) => false,
                None => {
                    per_peer.insert(cid.clone(), now);
                    true
                }
            })
            .collect()
    }

    /// Dispatch one routed message. Per-peer failures are reported as
    /// events and never tear the engine down.
    async fn handle_message(&self, routed: RoutedMessage) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.touch_sync_time().await;
        match routed.message {
            SyncMessage::Have { cids } => self.on_have(&routed.peer_id, cids).await,
            SyncMessage::Want { cids } => self.on_want(&routed.peer_id, cids).await,
            SyncMessage::BlockRequest { cid } => {
                self.on_want(&routed.peer_id, vec![cid]).await
            }
            SyncMessage::BlockResponse { block } => {
                self.on_response(&routed.peer_id, block).await
            }
        }
    }

    async fn on_have(&self, peer_id: &str, cids: Vec<Cid>) -> Result<(), SyncError> {
        debug!(%peer_id, count = cids.len(), "peer announced blocks");
        self.emit(SyncEvent::BlocksAnnounced {
            peer_id: peer_id.to_string(),
            cids: cids.clone(),
        })
        .await;
        if !self.config.auto_request_missing {
            return Ok(());
        }
        let mut missing = Vec::new();
        for cid in cids {
            if !self.store.has(&cid).await? {
                missing.push(cid);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let fresh = self.filter_recent_wants(peer_id, missing).await;
        if fresh.is_empty() {
            return Ok(());
        }
        let _permit = match self.requests.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };
        if let Err(e) = self
            .manager
            .send_to_peer(peer_id, &SyncMessage::Want { cids: fresh })
            .await
        {
            self.emit_error(Some(peer_id.to_string()), e.to_string()).await;
        }
        Ok(())
    }

    async fn on_want(&self, peer_id: &str, cids: Vec<Cid>) -> Result<(), SyncError> {
        debug!(%peer_id, count = cids.len(), "peer requested blocks");
        self.emit(SyncEvent::BlocksRequested {
            peer_id: peer_id.to_string(),
            cids: cids.clone(),
        })
        .await;
        for cid in cids {
            let Some(block) = self.store.get(&cid).await? else {
                continue;
            };
            match self
                .manager
                .send_to_peer(peer_id, &SyncMessage::BlockResponse { block })
                .await
            {
                Ok(()) => {
                    self.stats.write().await.total_blocks_sent += 1;
                }
                // best-effort: report and keep serving the rest
                Err(e) => {
                    self.emit_error(Some(peer_id.to_string()), e.to_string()).await;
                }
            }
        }
        Ok(())
    }

    async fn on_response(&self, peer_id: &str, block: Block) -> Result<(), SyncError> {
        if !block.validate() {
            self.emit_error(
                Some(peer_id.to_string()),
                format!("block {} failed validation, discarded", block.cid()),
            )
            .await;
            return Ok(());
        }
        let cid = block.cid().clone();
        self.store.put(block.clone()).await?;
        self.dag.add_block(&block).await?;
        self.stats.write().await.total_blocks_received += 1;
        debug!(%peer_id, %cid, "block received");
        self.emit(SyncEvent::BlockReceived {
            cid,
            from_peer: peer_id.to_string(),
        })
        .await;
        Ok(())
    }
}

/// Drives block replication against one peer manager, one store and one
/// DAG index.
pub struct Synchronizer {
    core: Arc<SyncCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn BlockStore>,
        dag: Arc<MerkleDag>,
        manager: Arc<PeerManager>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let requests = Semaphore::new(config.max_concurrent_requests.max(1));
        Self {
            core: Arc::new(SyncCore {
                store,
                dag,
                manager,
                config,
                stats: RwLock::new(SyncStats::default()),
                events: RwLock::new(Some(events)),
                requests,
                recent_wants: RwLock::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<dyn BlockStore> {
        self.core.store.clone()
    }

    pub fn dag(&self) -> Arc<MerkleDag> {
        self.core.dag.clone()
    }

    pub fn manager(&self) -> Arc<PeerManager> {
        self.core.manager.clone()
    }

    /// Subscribe to replication events.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<SyncEvent>, SyncError> {
        self.core.ensure_open()?;
        let events = self.core.events.read().await;
        events
            .as_ref()
            .map(|sender| sender.subscribe())
            .ok_or(SyncError::Closed)
    }

    /// Snapshot of the replication counters.
    pub async fn stats(&self) -> SyncStats {
        self.core.stats.read().await.clone()
    }

    /// Take the transport's incoming sequence and start the receive loop.
    /// Messages are processed in arrival order; errors on one message
    /// never stop the loop.
    pub async fn initialize(&self, transport: &dyn Transport) -> Result<(), SyncError> {
        self.core.ensure_open()?;
        let mut incoming = transport
            .incoming()
            .await
            .map_err(PeerManagerError::Transport)?;
        let core = Arc::clone(&self.core);
        let task = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                match core.manager.handle_incoming(message).await {
                    Ok(Some(routed)) => {
                        let peer_id = routed.peer_id.clone();
                        if let Err(e) = core.handle_message(routed).await {
                            core.emit_error(Some(peer_id), e.to_string()).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        core.emit_error(None, e.to_string()).await;
                    }
                }
            }
            debug!("incoming sequence closed, sync loop exiting");
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    /// Store a local block, index it, and (by configuration) announce it.
    /// The HAVE goes out strictly after the store write commits.
    pub async fn add_block(&self, block: Block) -> Result<Cid, SyncError> {
        self.core.ensure_open()?;
        let cid = block.cid().clone();
        if !self.core.store.put(block.clone()).await? {
            return Err(SyncError::InvalidBlock(cid));
        }
        self.core.dag.add_block(&block).await?;
        if self.core.config.announce_new_blocks {
            let delivered = self
                .core
                .manager
                .broadcast(&SyncMessage::Have {
                    cids: vec![cid.clone()],
                })
                .await;
            debug!(%cid, delivered, "announced new block");
        }
        Ok(cid)
    }

    /// Walk the DAG from `root` depth-first; record absent nodes without
    /// descending past them, then broadcast one WANT for the whole set.
    /// Returns the missing CIDs immediately; the blocks themselves arrive
    /// asynchronously through RESP handling.
    pub async fn fetch_missing_blocks(&self, root: &Cid) -> Result<Vec<Cid>, SyncError> {
        self.core.ensure_open()?;
        let mut missing = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(cid) = stack.pop() {
            if !visited.insert(cid.clone()) {
                continue;
            }
            match self.core.store.get(&cid).await? {
                Some(block) => {
                    for link in block.extract_links()? {
                        if !visited.contains(&link) {
                            stack.push(link);
                        }
                    }
                }
                None => missing.push(cid),
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "requesting missing blocks");
            self.core
                .manager
                .broadcast(&SyncMessage::Want {
                    cids: missing.clone(),
                })
                .await;
        }
        Ok(missing)
    }

    /// Feed one already-routed message through the engine, for embedders
    /// that drive the receive loop themselves.
    pub async fn handle_message(&self, routed: RoutedMessage) -> Result<(), SyncError> {
        self.core.handle_message(routed).await
    }

    /// Stop the receive loop, close the event channel and mark the engine
    /// closed. The transport itself is left running.
    pub async fn dispose(&self) {
        self.core.disposed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        // dropping the sender closes every subscriber
        self.core.events.write().await.take();
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Ok(task) = self.task.try_lock() {
            if let Some(task) = task.as_ref() {
                task.abort();
            }
        }
    }
}
