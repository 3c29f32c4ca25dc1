#![deny(unsafe_code)]
//! Storage and graph layers of the meshdag sync core.
//!
//! [`store`] defines the asynchronous [`BlockStore`] contract with its
//! in-memory and LRU-cached implementations plus mark-and-sweep garbage
//! collection; [`dag`] maintains the in-memory Merkle-DAG index over
//! stored blocks (traversal, cycle detection, topological order, stats).

pub mod dag;
pub mod store;

pub use dag::{DagError, DagStats, MerkleDag};
pub use store::{
    BlockStore, CachedBlockStore, GcReport, MemoryBlockStore, StoreError, StoreStats,
};
