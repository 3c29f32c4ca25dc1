//! Content identifiers: self-describing hashes over block bytes.

use crate::codec::{self, HashAlgorithm};
use crate::multihash::Multihash;
use crate::varint::{read_uvarint, write_uvarint};
use multibase::Base;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while constructing or parsing CIDs and multihashes.
#[derive(Error, Debug)]
pub enum CidError {
    #[error("invalid CID format: {0}")]
    InvalidFormat(String),
}

/// CID version. V0 is the legacy bare-multihash form, restricted to
/// SHA2-256 digests of dag-pb payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    V0,
    V1,
}

/// A content identifier: `(version, codec, multihash)`.
///
/// Binary form: v1 is `varint(1) ‖ varint(codec) ‖ multihash`; v0 is the
/// bare 34-byte SHA2-256 multihash. Text form: v0 is base58btc, v1 is
/// multibase base32 (prefix `b`). Equality and hashing are structural;
/// ordering follows the canonical binary form so CIDs work as map keys.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    version: Version,
    codec: u64,
    hash: Multihash,
}

impl Cid {
    /// Construct a v0 CID. The multihash must be SHA2-256 with a 32-byte
    /// digest; the codec is implicitly dag-pb.
    pub fn new_v0(hash: Multihash) -> Result<Self, CidError> {
        if hash.code() != codec::SHA2_256 || hash.size() != 32 {
            return Err(CidError::InvalidFormat(
                "v0 requires a 32-byte sha2-256 multihash".to_string(),
            ));
        }
        Ok(Self {
            version: Version::V0,
            codec: codec::DAG_PB,
            hash,
        })
    }

    /// Construct a v1 CID over any codec tag.
    pub fn new_v1(codec: u64, hash: Multihash) -> Self {
        Self {
            version: Version::V1,
            codec,
            hash,
        }
    }

    /// Hash `data` with `algo` and address it under `codec`.
    pub fn from_data(codec: u64, algo: HashAlgorithm, data: &[u8]) -> Self {
        Self::new_v1(codec, algo.digest(data))
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The codec tag. Unknown tags are carried opaquely.
    pub fn codec(&self) -> u64 {
        self.codec
    }

    pub fn hash(&self) -> &Multihash {
        &self.hash
    }

    /// Upgrade to v1 (identity on v1 CIDs). The text form changes; the
    /// hash does not.
    pub fn to_v1(&self) -> Cid {
        Cid {
            version: Version::V1,
            codec: self.codec,
            hash: self.hash.clone(),
        }
    }

    /// Append the canonical binary form to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self.version {
            Version::V0 => self.hash.write_to(buf),
            Version::V1 => {
                write_uvarint(1, buf);
                write_uvarint(self.codec, buf);
                self.hash.write_to(buf);
            }
        }
    }

    /// The canonical binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.hash.size());
        self.write_to(&mut buf);
        buf
    }

    /// Decode a CID from the front of `bytes`, returning it and the number
    /// of bytes consumed.
    pub fn read_from(bytes: &[u8]) -> Result<(Self, usize), CidError> {
        // Bare sha2-256 multihash prefix marks the legacy v0 form.
        if bytes.len() >= 2 && bytes[0] == 0x12 && bytes[1] == 0x20 {
            let (hash, consumed) = Multihash::read_from(bytes)?;
            return Ok((Self::new_v0(hash)?, consumed));
        }
        let (version, n) = read_uvarint(bytes)?;
        if version != 1 {
            return Err(CidError::InvalidFormat(format!(
                "unknown CID version {}",
                version
            )));
        }
        let (codec, m) = read_uvarint(&bytes[n..])?;
        let (hash, k) = Multihash::read_from(&bytes[n + m..])?;
        Ok((Self::new_v1(codec, hash), n + m + k))
    }

    /// Decode a CID that must occupy the whole input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (cid, consumed) = Self::read_from(bytes)?;
        if consumed != bytes.len() {
            return Err(CidError::InvalidFormat(
                "trailing bytes after CID".to_string(),
            ));
        }
        Ok(cid)
    }
}

impl Ord for Cid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Cid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Version::V0 => f.write_str(&Base::Base58Btc.encode(self.to_bytes())),
            Version::V1 => f.write_str(&multibase::encode(Base::Base32Lower, self.to_bytes())),
        }
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = CidError;

    /// Accepts both text forms: a bare base58btc string decoding to the
    /// 34-byte v0 shape, or any multibase-prefixed v1 string.
    fn from_str(s: &str) -> Result<Self, CidError> {
        if s.is_empty() {
            return Err(CidError::InvalidFormat("empty CID string".to_string()));
        }
        if let Ok(bytes) = Base::Base58Btc.decode(s) {
            if bytes.len() == 34 && bytes[0] == 0x12 && bytes[1] == 0x20 {
                return Cid::from_bytes(&bytes);
            }
        }
        let (_, bytes) = multibase::decode(s)
            .map_err(|e| CidError::InvalidFormat(format!("multibase: {}", e)))?;
        Cid::from_bytes(&bytes)
    }
}

// Serde carries CIDs as their canonical binary form.
impl Serialize for Cid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Cid::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
