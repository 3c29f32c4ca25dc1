//! In-memory block store, the reference [`BlockStore`] implementation.

use super::{BlockStore, StoreError, StoreStats};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use meshdag_core_types::{Block, Cid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A [`BlockStore`] backed by a hash map.
///
/// Puts are first-writer-wins per CID; content addressing makes later
/// identical writes no-ops.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Block>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, block: Block) -> Result<bool, StoreError> {
        self.ensure_open()?;
        if !block.validate() {
            return Ok(false);
        }
        let mut blocks = self.blocks.write().await;
        blocks.entry(block.cid().clone()).or_insert(block);
        Ok(true)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        self.ensure_open()?;
        Ok(self.blocks.read().await.get(cid).cloned())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.blocks.read().await.contains_key(cid))
    }

    async fn delete(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.blocks.write().await.remove(cid).is_some())
    }

    async fn list_cids(&self) -> Result<BoxStream<'static, Cid>, StoreError> {
        self.ensure_open()?;
        let snapshot: Vec<Cid> = self.blocks.read().await.keys().cloned().collect();
        Ok(stream::iter(snapshot).boxed())
    }

    async fn get_size(&self, cid: &Cid) -> Result<Option<u64>, StoreError> {
        self.ensure_open()?;
        Ok(self.blocks.read().await.get(cid).map(Block::size))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_open()?;
        let blocks = self.blocks.read().await;
        let total_blocks = blocks.len() as u64;
        let total_size = blocks.values().map(Block::size).sum();
        Ok(StoreStats::from_totals(total_blocks, total_size))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        self.blocks.write().await.clear();
        Ok(())
    }
}
