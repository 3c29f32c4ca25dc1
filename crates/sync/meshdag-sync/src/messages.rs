//! The sync wire protocol: a closed four-variant tagged union.
//!
//! Body layout (after the 1-byte tag):
//! HAVE/WANT — `varint(n) ‖ n × (varint(len) ‖ cid)`;
//! REQ — `varint(len) ‖ cid`;
//! RESP — `varint(len) ‖ cid ‖ varint(dataLen) ‖ data`.
//! Every value has exactly one encoding; decoders reject unknown tags,
//! truncation and trailing bytes without mutating any state.

use meshdag_core_types::varint::{read_uvarint, write_uvarint};
use meshdag_core_types::{Block, Cid};
use thiserror::Error;

pub const TAG_HAVE: u8 = 1;
pub const TAG_WANT: u8 = 2;
pub const TAG_BLOCK_REQUEST: u8 = 3;
pub const TAG_BLOCK_RESPONSE: u8 = 4;

/// Errors raised by the wire codec.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed sync message: {0}")]
    Malformed(String),
}

/// One sync-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Advertisement of locally held blocks.
    Have { cids: Vec<Cid> },
    /// Request for the advertised blocks the sender is missing.
    Want { cids: Vec<Cid> },
    /// Single-block request, kept for request/response matching.
    BlockRequest { cid: Cid },
    /// Delivery of one block.
    BlockResponse { block: Block },
}

impl SyncMessage {
    /// The wire tag for this variant.
    pub fn tag(&self) -> u8 {
        match self {
            SyncMessage::Have { .. } => TAG_HAVE,
            SyncMessage::Want { .. } => TAG_WANT,
            SyncMessage::BlockRequest { .. } => TAG_BLOCK_REQUEST,
            SyncMessage::BlockResponse { .. } => TAG_BLOCK_RESPONSE,
        }
    }

    /// Canonical binary encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag()];
        match self {
            SyncMessage::Have { cids } | SyncMessage::Want { cids } => {
                write_uvarint(cids.len() as u64, &mut buf);
                for cid in cids {
                    write_cid(cid, &mut buf);
                }
            }
            SyncMessage::BlockRequest { cid } => {
                write_cid(cid, &mut buf);
            }
            SyncMessage::BlockResponse { block } => {
                write_cid(block.cid(), &mut buf);
                write_uvarint(block.size(), &mut buf);
                buf.extend_from_slice(block.data());
            }
        }
        buf
    }

    /// Decode one message occupying the whole input.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| WireError::Malformed("empty message".to_string()))?;
        let mut pos = 0;
        let message = match tag {
            TAG_HAVE | TAG_WANT => {
                let count = read_varint(body, &mut pos)?;
                let count = usize::try_from(count)
                    .map_err(|_| WireError::Malformed("CID count overflow".to_string()))?;
                let mut cids = Vec::new();
                for _ in 0..count {
                    cids.push(read_cid(body, &mut pos)?);
                }
                if tag == TAG_HAVE {
                    SyncMessage::Have { cids }
                } else {
                    SyncMessage::Want { cids }
                }
            }
            TAG_BLOCK_REQUEST => SyncMessage::BlockRequest {
                cid: read_cid(body, &mut pos)?,
            },
            TAG_BLOCK_RESPONSE => {
                let cid = read_cid(body, &mut pos)?;
                let len = read_varint(body, &mut pos)?;
                let len = usize::try_from(len)
                    .map_err(|_| WireError::Malformed("data length overflow".to_string()))?;
                let end = pos
                    .checked_add(len)
                    .filter(|&end| end <= body.len())
                    .ok_or_else(|| WireError::Malformed("truncated block data".to_string()))?;
                let data = body[pos..end].to_vec();
                pos = end;
                SyncMessage::BlockResponse {
                    block: Block::with_cid(cid, data),
                }
            }
            other => {
                return Err(WireError::Malformed(format!("unknown tag {}", other)));
            }
        };
        if pos != body.len() {
            return Err(WireError::Malformed("trailing bytes".to_string()));
        }
        Ok(message)
    }
}

fn write_cid(cid: &Cid, buf: &mut Vec<u8>) {
    let bytes = cid.to_bytes();
    write_uvarint(bytes.len() as u64, buf);
    buf.extend_from_slice(&bytes);
}

fn read_varint(body: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let (value, consumed) = read_uvarint(&body[*pos..])
        .map_err(|e| WireError::Malformed(e.to_string()))?;
    *pos += consumed;
    Ok(value)
}

fn read_cid(body: &[u8], pos: &mut usize) -> Result<Cid, WireError> {
    let len = read_varint(body, pos)?;
    let len = usize::try_from(len)
        .map_err(|_| WireError::Malformed("CID length overflow".to_string()))?;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| WireError::Malformed("truncated CID".to_string()))?;
    let cid = Cid::from_bytes(&body[*pos..end])
        .map_err(|e| WireError::Malformed(e.to_string()))?;
    *pos = end;
    Ok(cid)
}
