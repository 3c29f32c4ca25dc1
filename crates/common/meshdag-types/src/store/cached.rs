//! LRU read-through decorator over any [`BlockStore`].

use super::{BlockStore, StoreError, StoreStats};
use async_trait::async_trait;
use futures::stream::BoxStream;
use lru::LruCache;
use meshdag_core_types::{Block, Cid};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wraps a backing store with an LRU of recently touched blocks.
///
/// `get` consults the cache first; `put` and `delete` keep it coherent;
/// `get_all` resolves cache hits locally and batches the miss set against
/// the backend. Eviction is least-recently-used by access or write.
pub struct CachedBlockStore<S> {
    backing: S,
    cache: Arc<Mutex<LruCache<Cid, Block>>>,
}

impl<S: BlockStore> CachedBlockStore<S> {
    /// Cap the cache at `capacity` entries (at least one).
    pub fn new(backing: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            backing,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// The wrapped store.
    pub fn backing(&self) -> &S {
        &self.backing
    }

    /// Number of blocks currently cached.
    pub async fn cached_blocks(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for CachedBlockStore<S> {
    async fn put(&self, block: Block) -> Result<bool, StoreError> {
        let stored = self.backing.put(block.clone()).await?;
        if stored {
            self.cache.lock().await.put(block.cid().clone(), block);
        }
        Ok(stored)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.cache.lock().await.get(cid) {
            return Ok(Some(block.clone()));
        }
        let loaded = self.backing.get(cid).await?;
        if let Some(block) = &loaded {
            self.cache.lock().await.put(cid.clone(), block.clone());
        }
        Ok(loaded)
    }

    async fn get_all(&self, cids: &[Cid]) -> Result<Vec<Option<Block>>, StoreError> {
        let mut out: Vec<Option<Block>> = vec![None; cids.len()];
        let mut miss_positions = Vec::new();
        let mut misses = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (i, cid) in cids.iter().enumerate() {
                match cache.get(cid) {
                    Some(block) => out[i] = Some(block.clone()),
                    None => {
                        miss_positions.push(i);
                        misses.push(cid.clone());
                    }
                }
            }
        }
        if !misses.is_empty() {
            let loaded = self.backing.get_all(&misses).await?;
            let mut cache = self.cache.lock().await;
            for (slot, block) in miss_positions.into_iter().zip(loaded) {
                if let Some(block) = &block {
                    cache.put(block.cid().clone(), block.clone());
                }
                out[slot] = block;
            }
        }
        Ok(out)
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        if self.cache.lock().await.contains(cid) {
            return Ok(true);
        }
        self.backing.has(cid).await
    }

    async fn delete(&self, cid: &Cid) -> Result<bool, StoreError> {
        let removed = self.backing.delete(cid).await?;
        self.cache.lock().await.pop(cid);
        Ok(removed)
    }

    async fn list_cids(&self) -> Result<BoxStream<'static, Cid>, StoreError> {
        self.backing.list_cids().await
    }

    async fn get_size(&self, cid: &Cid) -> Result<Option<u64>, StoreError> {
        if let Some(block) = self.cache.lock().await.peek(cid) {
            return Ok(Some(block.size()));
        }
        self.backing.get_size(cid).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.backing.stats().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.cache.lock().await.clear();
        self.backing.close().await
    }
}
