//! Incremental content hashing over ordered chunks.

use crate::models::content_hash::ContentHash;
use md5::Context;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("chunk {got} fed to hasher, expected chunk {expected}")]
pub struct OutOfOrderChunk {
    pub expected: u32,
    pub got: u32,
}

/// Accumulates a [`ContentHash`] over chunks fed in ascending index order.
///
/// Feeding chunks `0..n` with no gaps yields the same digest as hashing the
/// concatenated bytes in one pass. `finalize` consumes the hasher.
pub struct StreamingHasher {
    digest: Context,
    next_index: u32,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            digest: Context::new(),
            next_index: 0,
            bytes: 0,
        }
    }

    /// Feed chunk `index`. Anything other than the next index is refused and
    /// leaves the digest untouched.
    pub fn update_chunk(&mut self, index: u32, data: &[u8]) -> Result<(), OutOfOrderChunk> {
        if index != self.next_index {
            return Err(OutOfOrderChunk {
                expected: self.next_index,
                got: index,
            });
        }
        self.digest.consume(data);
        self.bytes += data.len() as u64;
        self.next_index += 1;
        Ok(())
    }

    /// Number of bytes consumed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash::from_bytes(self.digest.compute().0)
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}
