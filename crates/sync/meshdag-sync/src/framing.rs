//! Length-prefix framing for transports without message boundaries.
//!
//! The wire frame is `varint(len) ‖ len × byte`. Transports that already
//! preserve boundaries (the in-memory hub, datagram radios) hand message
//! bodies through untouched; stream transports wrap their byte flow in a
//! [`FrameDecoder`] before exposing the [`crate::Transport`] interface.

use crate::messages::WireError;
use meshdag_core_types::varint::{read_uvarint, write_uvarint};

/// Frames larger than this are treated as protocol corruption rather than
/// buffered indefinitely.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prefix `body` with its varint length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(body.len() + 5);
    write_uvarint(body.len() as u64, &mut buf);
    buf.extend_from_slice(body);
    buf
}

/// Incremental frame reassembly over an arbitrary chunking of the byte
/// stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, or `None` when more bytes are
    /// needed. Oversized or unparsable length prefixes are `Malformed`;
    /// the decoder is unusable afterwards and the connection should be
    /// dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let (len, header) = match read_uvarint(&self.buf) {
            Ok(decoded) => decoded,
            // a partial varint is just an incomplete frame
            Err(_) if self.buf.len() < 9 => return Ok(None),
            Err(e) => return Err(WireError::Malformed(e.to_string())),
        };
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| WireError::Malformed("frame length out of range".to_string()))?;
        if self.buf.len() < header + len {
            return Ok(None);
        }
        let body = self.buf[header..header + len].to_vec();
        self.buf.drain(..header + len);
        Ok(Some(body))
    }

    /// Bytes buffered but not yet consumed as frames.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
