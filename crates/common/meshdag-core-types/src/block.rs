//! The unit of storage and exchange: an immutable `(cid, bytes)` pair.

use crate::cid::Cid;
use crate::codec::{Codec, HashAlgorithm};
use crate::varint::read_uvarint;
use ciborium::value::Value as CborValue;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by block validation and link extraction.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("corrupt block payload for {0}")]
    CorruptBlock(Cid),
}

/// An immutable content-addressed byte container.
///
/// The invariant `cid == hash(data)` holds for blocks built with
/// [`Block::from_data`]; [`Block::with_cid`] skips re-hashing for trusted
/// reads and leaves verification to [`Block::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Hash `data` and wrap it in a block addressed under `codec`.
    pub fn from_data(data: impl Into<Vec<u8>>, codec: u64, algo: HashAlgorithm) -> Self {
        let data = data.into();
        let cid = Cid::from_data(codec, algo, &data);
        Self { cid, data }
    }

    /// Construct without re-hashing, for trusted reads from storage.
    pub fn with_cid(cid: Cid, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Recompute the digest and compare it against the CID. Blocks hashed
    /// with an unregistered algorithm cannot be proven and fail validation.
    pub fn validate(&self) -> bool {
        match HashAlgorithm::from_code(self.cid.hash().code()) {
            Some(algo) => algo.digest(&self.data) == *self.cid.hash(),
            None => false,
        }
    }

    /// The CIDs this block's payload declares as outgoing links,
    /// dispatched on the CID's codec tag. Unknown codecs have no
    /// registered extractor and yield no links; structurally invalid
    /// payloads fail with [`BlockError::CorruptBlock`].
    pub fn extract_links(&self) -> Result<Vec<Cid>, BlockError> {
        match Codec::from_code(self.cid.codec()) {
            Some(Codec::Raw) | None => Ok(Vec::new()),
            Some(Codec::DagPb) => self.dag_pb_links(),
            Some(Codec::DagCbor) => self.dag_cbor_links(),
            Some(Codec::DagJson) => self.dag_json_links(),
        }
    }

    fn corrupt(&self) -> BlockError {
        BlockError::CorruptBlock(self.cid.clone())
    }

    /// Walk the protobuf framing of a dag-pb node and collect the Hash
    /// field of every length-prefixed link record (field 2 of the node,
    /// field 1 of each record).
    fn dag_pb_links(&self) -> Result<Vec<Cid>, BlockError> {
        let mut links = Vec::new();
        let bytes = &self.data;
        let mut pos = 0;
        while pos < bytes.len() {
            let (key, n) = read_uvarint(&bytes[pos..]).map_err(|_| self.corrupt())?;
            pos += n;
            let field = key >> 3;
            match key & 0x07 {
                // length-delimited
                2 => {
                    let (len, n) = read_uvarint(&bytes[pos..]).map_err(|_| self.corrupt())?;
                    pos += n;
                    let len = usize::try_from(len).map_err(|_| self.corrupt())?;
                    let end = pos.checked_add(len).ok_or_else(|| self.corrupt())?;
                    if end > bytes.len() {
                        return Err(self.corrupt());
                    }
                    if field == 2 {
                        links.push(self.dag_pb_link_hash(&bytes[pos..end])?);
                    }
                    pos = end;
                }
                // varint
                0 => {
                    let (_, n) = read_uvarint(&bytes[pos..]).map_err(|_| self.corrupt())?;
                    pos += n;
                }
                // fixed64
                1 => {
                    pos = pos.checked_add(8).filter(|&p| p <= bytes.len()).ok_or_else(|| self.corrupt())?;
                }
                // fixed32
                5 => {
                    pos = pos.checked_add(4).filter(|&p| p <= bytes.len()).ok_or_else(|| self.corrupt())?;
                }
                _ => return Err(self.corrupt()),
            }
        }
        Ok(links)
    }

    /// Pull the Hash field out of one link record.
    fn dag_pb_link_hash(&self, record: &[u8]) -> Result<Cid, BlockError> {
        let mut pos = 0;
        let mut hash = None;
        while pos < record.len() {
            let (key, n) = read_uvarint(&record[pos..]).map_err(|_| self.corrupt())?;
            pos += n;
            match key & 0x07 {
                2 => {
                    let (len, n) = read_uvarint(&record[pos..]).map_err(|_| self.corrupt())?;
                    pos += n;
                    let len = usize::try_from(len).map_err(|_| self.corrupt())?;
                    let end = pos.checked_add(len).ok_or_else(|| self.corrupt())?;
                    if end > record.len() {
                        return Err(self.corrupt());
                    }
                    if key >> 3 == 1 {
                        hash = Some(Cid::from_bytes(&record[pos..end]).map_err(|_| self.corrupt())?);
                    }
                    pos = end;
                }
                0 => {
                    let (_, n) = read_uvarint(&record[pos..]).map_err(|_| self.corrupt())?;
                    pos += n;
                }
                _ => return Err(self.corrupt()),
            }
        }
        hash.ok_or_else(|| self.corrupt())
    }

    /// Walk a decoded CBOR value and collect tag-42 CID leaves. The walk
    /// is iterative so hostile nesting cannot blow the stack.
    fn dag_cbor_links(&self) -> Result<Vec<Cid>, BlockError> {
        let root: CborValue =
            ciborium::de::from_reader(self.data.as_slice()).map_err(|_| self.corrupt())?;
        let mut links = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(&root);
        while let Some(value) = queue.pop_front() {
            match value {
                CborValue::Tag(42, inner) => match inner.as_ref() {
                    // dag-cbor carries CIDs as a byte string with an
                    // identity-multibase 0x00 prefix
                    CborValue::Bytes(bytes) if bytes.first() == Some(&0x00) => {
                        links.push(Cid::from_bytes(&bytes[1..]).map_err(|_| self.corrupt())?);
                    }
                    _ => return Err(self.corrupt()),
                },
                CborValue::Tag(_, inner) => queue.push_back(inner),
                CborValue::Array(items) => queue.extend(items.iter()),
                CborValue::Map(entries) => {
                    for (key, val) in entries {
                        queue.push_back(key);
                        queue.push_back(val);
                    }
                }
                _ => {}
            }
        }
        Ok(links)
    }

    /// Walk a decoded JSON value and collect `{"/": "<cid>"}` leaves.
    fn dag_json_links(&self) -> Result<Vec<Cid>, BlockError> {
        let root: JsonValue = serde_json::from_slice(&self.data).map_err(|_| self.corrupt())?;
        let mut links = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(&root);
        while let Some(value) = queue.pop_front() {
            match value {
                JsonValue::Object(map) => {
                    if map.len() == 1 {
                        if let Some(JsonValue::String(text)) = map.get("/") {
                            links.push(Cid::from_str(text).map_err(|_| self.corrupt())?);
                            continue;
                        }
                    }
                    queue.extend(map.values());
                }
                JsonValue::Array(items) => queue.extend(items.iter()),
                _ => {}
            }
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::varint::write_uvarint;

    fn raw_block(data: &[u8]) -> Block {
        Block::from_data(data, codec::RAW, HashAlgorithm::Sha2_256)
    }

    /// Serialize a CBOR value the way dag-cbor would.
    fn cbor_bytes(value: &CborValue) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).unwrap();
        buf
    }

    fn cbor_link(cid: &Cid) -> CborValue {
        let mut bytes = vec![0x00];
        bytes.extend(cid.to_bytes());
        CborValue::Tag(42, Box::new(CborValue::Bytes(bytes)))
    }

    #[test]
    fn from_data_validates() {
        assert!(raw_block(b"hello").validate());
    }

    #[test]
    fn empty_block_validates_with_no_links() {
        let block = raw_block(b"");
        assert!(block.validate());
        assert_eq!(block.size(), 0);
        assert!(block.extract_links().unwrap().is_empty());
    }

    #[test]
    fn tampered_data_fails_validation() {
        let good = raw_block(b"hello");
        let bad = Block::with_cid(good.cid().clone(), b"hell".to_vec());
        assert!(!bad.validate());
    }

    #[test]
    fn unknown_hash_algorithm_fails_validation() {
        let hash = crate::multihash::Multihash::wrap(0x1e, vec![0u8; 32]);
        let block = Block::with_cid(Cid::new_v1(codec::RAW, hash), b"data".to_vec());
        assert!(!block.validate());
    }

    #[test]
    fn raw_and_unknown_codecs_have_no_links() {
        assert!(raw_block(b"payload").extract_links().unwrap().is_empty());
        let block = Block::from_data(b"payload".to_vec(), 0x0300, HashAlgorithm::Sha2_256);
        assert!(block.extract_links().unwrap().is_empty());
    }

    #[test]
    fn dag_cbor_links_are_collected() {
        let target_a = raw_block(b"a");
        let target_b = raw_block(b"b");
        let value = CborValue::Map(vec![
            (
                CborValue::Text("left".into()),
                cbor_link(target_a.cid()),
            ),
            (
                CborValue::Text("rest".into()),
                CborValue::Array(vec![cbor_link(target_b.cid()), CborValue::Integer(7.into())]),
            ),
        ]);
        let block = Block::from_data(
            cbor_bytes(&value),
            codec::DAG_CBOR,
            HashAlgorithm::Sha2_256,
        );
        let links = block.extract_links().unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.contains(target_a.cid()));
        assert!(links.contains(target_b.cid()));
    }

    #[test]
    fn dag_cbor_garbage_is_corrupt() {
        let block = Block::from_data(
            vec![0xff, 0xfe, 0xfd],
            codec::DAG_CBOR,
            HashAlgorithm::Sha2_256,
        );
        assert!(matches!(
            block.extract_links(),
            Err(BlockError::CorruptBlock(_))
        ));
    }

    #[test]
    fn dag_json_links_are_collected() {
        let target = raw_block(b"json target");
        let payload = format!(
            r#"{{"name":"node","child":{{"/":"{}"}},"items":[1,{{"/":"{}"}}]}}"#,
            target.cid(),
            target.cid()
        );
        let block = Block::from_data(
            payload.into_bytes(),
            codec::DAG_JSON,
            HashAlgorithm::Sha2_256,
        );
        let links = block.extract_links().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(&links[0], target.cid());
    }

    #[test]
    fn dag_json_bad_cid_is_corrupt() {
        let block = Block::from_data(
            br#"{"/":"not a cid"}"#.to_vec(),
            codec::DAG_JSON,
            HashAlgorithm::Sha2_256,
        );
        assert!(block.extract_links().is_err());
    }

    #[test]
    fn dag_pb_links_are_collected() {
        let target = raw_block(b"pb target");
        let cid_bytes = target.cid().to_bytes();
        // PBLink { Hash = field 1 }
        let mut record = vec![0x0a];
        write_uvarint(cid_bytes.len() as u64, &mut record);
        record.extend(&cid_bytes);
        // PBNode { Links = field 2 }
        let mut node = vec![0x12];
        write_uvarint(record.len() as u64, &mut node);
        node.extend(&record);
        let block = Block::from_data(node, codec::DAG_PB, HashAlgorithm::Sha2_256);
        let links = block.extract_links().unwrap();
        assert_eq!(links, vec![target.cid().clone()]);
    }

    #[test]
    fn dag_pb_truncated_record_is_corrupt() {
        // declares a 200-byte link record but supplies 2 bytes
        let node = vec![0x12, 0xc8, 0x01, 0x00, 0x00];
        let block = Block::from_data(node, codec::DAG_PB, HashAlgorithm::Sha2_256);
        assert!(block.extract_links().is_err());
    }
}
