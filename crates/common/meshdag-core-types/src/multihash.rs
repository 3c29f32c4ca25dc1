//! Multihash: a digest tagged with the algorithm that produced it.

use crate::cid::CidError;
use crate::varint::{read_uvarint, write_uvarint};
use std::fmt;

/// A self-describing hash: `(code, size, digest)` where `size` is always
/// the digest length. Binary form is `varint(code) ‖ varint(size) ‖ digest`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Multihash {
    code: u64,
    digest: Vec<u8>,
}

impl Multihash {
    /// Wrap an already-computed digest with its algorithm code.
    pub fn wrap(code: u64, digest: Vec<u8>) -> Self {
        Self { code, digest }
    }

    /// The hash-algorithm code.
    pub fn code(&self) -> u64 {
        self.code
    }

    /// Digest length in bytes.
    pub fn size(&self) -> usize {
        self.digest.len()
    }

    /// The digest bytes.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Append the binary form to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        write_uvarint(self.code, buf);
        write_uvarint(self.digest.len() as u64, buf);
        buf.extend_from_slice(&self.digest);
    }

    /// The binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.digest.len());
        self.write_to(&mut buf);
        buf
    }

    /// Decode a multihash from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    pub fn read_from(bytes: &[u8]) -> Result<(Self, usize), CidError> {
        let (code, n) = read_uvarint(bytes)?;
        let (size, m) = read_uvarint(&bytes[n..])?;
        let header = n + m;
        let size = usize::try_from(size)
            .map_err(|_| CidError::InvalidFormat("digest size overflow".to_string()))?;
        let rest = &bytes[header..];
        if rest.len() < size {
            return Err(CidError::InvalidFormat(format!(
                "truncated digest: want {} bytes, have {}",
                size,
                rest.len()
            )));
        }
        let digest = rest[..size].to_vec();
        Ok((Self { code, digest }, header + size))
    }

    /// Decode a multihash that must occupy the whole input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (hash, consumed) = Self::read_from(bytes)?;
        if consumed != bytes.len() {
            return Err(CidError::InvalidFormat(
                "trailing bytes after multihash".to_string(),
            ));
        }
        Ok(hash)
    }
}

impl fmt::Debug for Multihash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Multihash(0x{:x}, {})",
            self.code,
            hex::encode(&self.digest)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HashAlgorithm;

    #[test]
    fn binary_round_trip() {
        let hash = HashAlgorithm::Sha2_256.digest(b"round trip");
        let bytes = hash.to_bytes();
        assert_eq!(Multihash::from_bytes(&bytes).unwrap(), hash);
    }

    #[test]
    fn sha256_layout() {
        let hash = HashAlgorithm::Sha2_256.digest(b"layout");
        let bytes = hash.to_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[0], 0x12);
        assert_eq!(bytes[1], 0x20);
    }

    #[test]
    fn truncated_digest_is_rejected() {
        let mut bytes = HashAlgorithm::Sha2_256.digest(b"x").to_bytes();
        bytes.truncate(10);
        assert!(Multihash::from_bytes(&bytes).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = HashAlgorithm::Sha2_256.digest(b"x").to_bytes();
        bytes.push(0x00);
        assert!(Multihash::from_bytes(&bytes).is_err());
        // read_from tolerates the tail and reports what it consumed
        let (_, consumed) = Multihash::read_from(&bytes).unwrap();
        assert_eq!(consumed, bytes.len() - 1);
    }
}
