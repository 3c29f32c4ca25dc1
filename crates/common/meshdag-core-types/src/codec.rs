//! Closed registries for the IPLD codecs and hash functions the core
//! understands.
//!
//! CIDs carry their codec tag as a raw `u64` so unknown codecs still parse;
//! these registries are consulted only where behavior depends on the tag
//! (link extraction, digest computation).

use crate::multihash::Multihash;
use sha2::{Digest, Sha256, Sha512};

/// Raw bytes, no links.
pub const RAW: u64 = 0x55;
/// Protobuf-framed node with length-prefixed link records.
pub const DAG_PB: u64 = 0x70;
/// CBOR with CID links as tag 42.
pub const DAG_CBOR: u64 = 0x71;
/// JSON with CID links as `{"/": "<cid>"}`.
pub const DAG_JSON: u64 = 0x0129;

/// The content codecs with registered link-extraction behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Raw,
    DagPb,
    DagCbor,
    DagJson,
}

impl Codec {
    /// The multicodec tag for this codec.
    pub fn code(self) -> u64 {
        match self {
            Codec::Raw => RAW,
            Codec::DagPb => DAG_PB,
            Codec::DagCbor => DAG_CBOR,
            Codec::DagJson => DAG_JSON,
        }
    }

    /// Look up a registered codec by tag. Unknown tags return `None` and
    /// are treated as link-free by the block layer.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            RAW => Some(Codec::Raw),
            DAG_PB => Some(Codec::DagPb),
            DAG_CBOR => Some(Codec::DagCbor),
            DAG_JSON => Some(Codec::DagJson),
            _ => None,
        }
    }
}

/// Multihash code for SHA2-256.
pub const SHA2_256: u64 = 0x12;
/// Multihash code for SHA2-512.
pub const SHA2_512: u64 = 0x13;

/// The digest functions blocks can be addressed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha2_256,
    Sha2_512,
}

impl HashAlgorithm {
    /// The multihash code for this algorithm.
    pub fn code(self) -> u64 {
        match self {
            HashAlgorithm::Sha2_256 => SHA2_256,
            HashAlgorithm::Sha2_512 => SHA2_512,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha2_256 => 32,
            HashAlgorithm::Sha2_512 => 64,
        }
    }

    /// Look up an algorithm by multihash code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            SHA2_256 => Some(HashAlgorithm::Sha2_256),
            SHA2_512 => Some(HashAlgorithm::Sha2_512),
            _ => None,
        }
    }

    /// Hash `data` and wrap the digest in a [`Multihash`].
    pub fn digest(self, data: &[u8]) -> Multihash {
        match self {
            HashAlgorithm::Sha2_256 => {
                Multihash::wrap(SHA2_256, Sha256::digest(data).to_vec())
            }
            HashAlgorithm::Sha2_512 => {
                Multihash::wrap(SHA2_512, Sha512::digest(data).to_vec())
            }
        }
    }
}
