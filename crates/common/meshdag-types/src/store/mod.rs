//! The asynchronous key/value contract over content-addressed blocks.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use meshdag_core_types::{Block, BlockError, Cid};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub mod cached;
pub mod memory;

pub use cached::CachedBlockStore;
pub use memory::MemoryBlockStore;

/// Errors raised by block stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation on a store that has been closed.
    #[error("store is closed")]
    Closed,
    /// A stored block no longer matches its CID.
    #[error(transparent)]
    Corrupt(#[from] BlockError),
    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Aggregate figures over the stored blocks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StoreStats {
    pub total_blocks: u64,
    pub total_size: u64,
    pub average_block_size: f64,
}

impl StoreStats {
    pub(crate) fn from_totals(total_blocks: u64, total_size: u64) -> Self {
        let average_block_size = if total_blocks == 0 {
            0.0
        } else {
            total_size as f64 / total_blocks as f64
        };
        Self {
            total_blocks,
            total_size,
            average_block_size,
        }
    }
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcReport {
    pub blocks_removed: usize,
    pub bytes_freed: u64,
    pub duration: Duration,
}

/// Mapping from CID to block. Keys are unique; stored blocks validate
/// against their CID; `put` of a duplicate CID is an idempotent no-op
/// (first writer wins). All operations fail with [`StoreError::Closed`]
/// after the first `close`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Validate and persist a block. Returns `false` without persisting
    /// when validation fails.
    async fn put(&self, block: Block) -> Result<bool, StoreError>;

    /// Retrieve a block by CID.
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError>;

    /// Whether a block is present.
    async fn has(&self, cid: &Cid) -> Result<bool, StoreError>;

    /// Remove a block. Returns whether an entry existed.
    async fn delete(&self, cid: &Cid) -> Result<bool, StoreError>;

    /// Batched [`BlockStore::put`]; returns how many blocks were stored.
    async fn put_all(&self, blocks: Vec<Block>) -> Result<usize, StoreError> {
        let mut stored = 0;
        for block in blocks {
            if self.put(block).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Batched [`BlockStore::get`], preserving input order.
    async fn get_all(&self, cids: &[Cid]) -> Result<Vec<Option<Block>>, StoreError> {
        let mut out = Vec::with_capacity(cids.len());
        for cid in cids {
            out.push(self.get(cid).await?);
        }
        Ok(out)
    }

    /// Batched [`BlockStore::has`], preserving input order.
    async fn has_all(&self, cids: &[Cid]) -> Result<Vec<bool>, StoreError> {
        let mut out = Vec::with_capacity(cids.len());
        for cid in cids {
            out.push(self.has(cid).await?);
        }
        Ok(out)
    }

    /// Batched [`BlockStore::delete`]; returns how many entries existed.
    async fn delete_all(&self, cids: &[Cid]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for cid in cids {
            if self.delete(cid).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// A restartable sequence of every stored CID, in unspecified order.
    /// Each call starts a fresh snapshot.
    async fn list_cids(&self) -> Result<BoxStream<'static, Cid>, StoreError>;

    /// Payload length of a stored block, or `None` when absent.
    async fn get_size(&self, cid: &Cid) -> Result<Option<u64>, StoreError>;

    /// Aggregate figures over the stored blocks.
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Close the store. Idempotent after the first call; every other
    /// operation fails with [`StoreError::Closed`] afterwards.
    async fn close(&self) -> Result<(), StoreError>;

    /// Mark-and-sweep garbage collection: breadth-first mark from `roots`
    /// following declared links, then sweep every unmarked entry.
    ///
    /// The sweep runs over a CID snapshot taken after the mark phase, so
    /// blocks stored concurrently are conservatively preserved; a
    /// reachable block is never removed.
    async fn collect_garbage(&self, roots: &[Cid]) -> Result<GcReport, StoreError> {
        let started = Instant::now();
        let mut reachable: HashSet<Cid> = HashSet::new();
        let mut frontier: VecDeque<Cid> = roots.iter().cloned().collect();
        while let Some(cid) = frontier.pop_front() {
            if !reachable.insert(cid.clone()) {
                continue;
            }
            if let Some(block) = self.get(&cid).await? {
                for link in block.extract_links()? {
                    if !reachable.contains(&link) {
                        frontier.push_back(link);
                    }
                }
            }
        }

        let mut blocks_removed = 0;
        let mut bytes_freed = 0u64;
        let mut snapshot = self.list_cids().await?;
        while let Some(cid) = snapshot.next().await {
            if reachable.contains(&cid) {
                continue;
            }
            let size = self.get_size(&cid).await?.unwrap_or(0);
            if self.delete(&cid).await? {
                blocks_removed += 1;
                bytes_freed += size;
            }
        }
        let duration = started.elapsed();
        debug!(blocks_removed, bytes_freed, ?duration, "garbage collection swept");
        Ok(GcReport {
            blocks_removed,
            bytes_freed,
            duration,
        })
    }
}
