//! Per-piece download state.
//!
//! A piece arrives as out-of-order blocks, each carrying its own offset.
//! [`PieceProgress`] owns the assembly buffer plus the two watermarks the
//! request pipeline runs on: `requested` (bytes asked for so far) and
//! `downloaded` (unique bytes received so far).
use super::{PeerError, PeerResult};
use sha1::{Digest, Sha1};

/// Largest block a single Request asks for: 16 KiB, the convention every
/// mainstream client enforces.
pub const MAX_BLOCK_SIZE: usize = 16384;

pub struct PieceProgress {
    index: u32,
    buffer: Vec<u8>,
    downloaded: usize,
    requested: usize,
    /// One flag per block offset, so a re-sent block never counts twice.
    received: Vec<bool>,
}

impl PieceProgress {
    pub fn new(index: u32, length: usize) -> Self {
        Self {
            index,
            buffer: vec![0u8; length],
            downloaded: 0,
            requested: 0,
            received: vec![false; length.div_ceil(MAX_BLOCK_SIZE)],
        }
    }

    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    /// Unique bytes received.
    pub fn downloaded(&self) -> usize {
        self.downloaded
    }

    /// Bytes requested so far; the next Request starts here.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn note_requested(&mut self, bytes: usize) {
        self.requested += bytes;
    }

    /// Copies a received block into the buffer at its offset.
    ///
    /// Out-of-order delivery is fine; each block carries `begin`. Blocks
    /// that land outside the piece fail with [`PeerError::OutOfBounds`].
    /// A block already seen at the same offset is copied again but not
    /// counted, keeping `downloaded` a measure of unique coverage.
    pub fn add_block(&mut self, begin: usize, data: &[u8]) -> PeerResult<()> {
        let end = begin
            .checked_add(data.len())
            .ok_or(PeerError::OutOfBounds { begin, len: data.len() })?;
        if end > self.buffer.len() {
            return Err(PeerError::OutOfBounds { begin, len: data.len() });
        }
        self.buffer[begin..end].copy_from_slice(data);

        // An empty block at the very end of the buffer has no slot.
        if let Some(slot) = self.received.get_mut(begin / MAX_BLOCK_SIZE) {
            if !*slot {
                *slot = true;
                self.downloaded += data.len();
            }
        }
        Ok(())
    }

    /// Verifies the assembled piece against its expected SHA-1.
    pub fn verify(&self, expected: &[u8; 20]) -> PeerResult<()> {
        let actual: [u8; 20] = Sha1::digest(&self.buffer).into();
        if &actual != expected {
            return Err(PeerError::HashMismatch { index: self.index });
        }
        Ok(())
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
