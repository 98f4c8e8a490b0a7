//! Chunk allocation for records
//!
//! Every record occupies one contiguous run of chunks. The bitmap tracks
//! which chunks hold live, pending or garbage records so new generations
//! never overwrite bytes an older generation still owns.

pub mod bitmap;

pub use bitmap::ChunkBitmap;

use crate::record::CHUNK_SIZE;
use serde::{Deserialize, Serialize};

/// A contiguous run of chunks on the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    /// First chunk index
    pub start: u32,
    /// Number of chunks
    pub chunks: u32,
}

impl Extent {
    pub fn new(start: u32, chunks: u32) -> Self {
        Extent { start, chunks }
    }

    /// Extent covering `len` bytes starting at byte `offset`
    pub fn from_bytes(offset: u64, len: usize) -> Self {
        Extent {
            start: (offset / CHUNK_SIZE as u64) as u32,
            chunks: chunks_for(len),
        }
    }

    pub fn offset(&self) -> u64 {
        self.start as u64 * CHUNK_SIZE as u64
    }

    pub fn len(&self) -> u64 {
        self.chunks as u64 * CHUNK_SIZE as u64
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    pub fn end(&self) -> u32 {
        self.start + self.chunks
    }
}

/// Chunks needed to hold `len` bytes
pub fn chunks_for(len: usize) -> u32 {
    ((len + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32
}
