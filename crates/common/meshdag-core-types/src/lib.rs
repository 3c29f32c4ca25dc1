#![deny(unsafe_code)]
//! Core content-addressing types for the meshdag workspace.
//!
//! Everything a block-exchange engine needs to name and verify bytes:
//! unsigned varints, multihashes, the two-version [`Cid`], the closed
//! codec/hash registries, and the [`Block`] container with codec-driven
//! link extraction.

pub mod block;
pub mod cid;
pub mod codec;
pub mod multihash;
pub mod varint;

pub use block::{Block, BlockError};
pub use cid::{Cid, CidError, Version};
pub use codec::{Codec, HashAlgorithm};
pub use multihash::Multihash;
