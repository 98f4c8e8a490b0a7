//! Bitmap allocator over medium chunks
//!
//! One bit per chunk:
//! - 0 = free (erased or reclaimable)
//! - 1 = held by a record

use super::Extent;
use crate::error::{CfstoreError, Result};
use crate::record::CHUNK_SIZE;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkBitmap {
    /// Bitmap words (each word = 64 chunks)
    bitmap: Vec<u64>,

    total_chunks: usize,

    free_chunks: usize,
}

impl ChunkBitmap {
    pub fn new(total_chunks: usize) -> Self {
        let num_words = (total_chunks + 63) / 64;
        ChunkBitmap {
            bitmap: vec![0u64; num_words],
            total_chunks,
            free_chunks: total_chunks,
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn free_chunks(&self) -> usize {
        self.free_chunks
    }

    pub fn is_allocated(&self, chunk: u32) -> bool {
        let chunk = chunk as usize;
        if chunk >= self.total_chunks {
            return false;
        }
        (self.bitmap[chunk / 64] & (1u64 << (chunk % 64))) != 0
    }

    fn set(&mut self, chunk: usize, allocated: bool) {
        let mask = 1u64 << (chunk % 64);
        if allocated {
            self.bitmap[chunk / 64] |= mask;
        } else {
            self.bitmap[chunk / 64] &= !mask;
        }
    }

    fn run_is_free(&self, start: usize, chunks: usize) -> bool {
        start + chunks <= self.total_chunks
            && (start..start + chunks).all(|c| !self.is_allocated(c as u32))
    }

    fn exhausted(chunks: usize) -> CfstoreError {
        CfstoreError::StorageExhausted {
            needed: (chunks * CHUNK_SIZE) as u64,
        }
    }

    /// First-fit allocation of a contiguous run
    pub fn allocate(&mut self, chunks: u32) -> Result<Extent> {
        let needed = chunks as usize;
        if needed == 0 || needed > self.free_chunks {
            return Err(Self::exhausted(needed));
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for chunk in 0..self.total_chunks {
            if self.bitmap[chunk / 64] == u64::MAX || self.is_allocated(chunk as u32) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = chunk;
            }
            run_len += 1;
            if run_len == needed {
                let extent = Extent::new(run_start as u32, chunks);
                self.mark(extent);
                return Ok(extent);
            }
        }

        Err(Self::exhausted(needed))
    }

    /// Allocate exactly `extent`; every chunk in it must be free
    pub fn allocate_at(&mut self, extent: Extent) -> Result<Extent> {
        if extent.is_empty() || !self.run_is_free(extent.start as usize, extent.chunks as usize) {
            return Err(Self::exhausted(extent.chunks as usize));
        }
        self.mark(extent);
        Ok(extent)
    }

    /// Grow `extent` in place to `chunks` if the following chunks are free
    pub fn try_extend(&mut self, extent: Extent, chunks: u32) -> Option<Extent> {
        if chunks <= extent.chunks {
            return Some(extent);
        }
        let extra = Extent::new(extent.end(), chunks - extent.chunks);
        if !self.run_is_free(extra.start as usize, extra.chunks as usize) {
            return None;
        }
        self.mark(extra);
        Some(Extent::new(extent.start, chunks))
    }

    fn mark(&mut self, extent: Extent) {
        for chunk in extent.start as usize..extent.end() as usize {
            self.set(chunk, true);
        }
        self.free_chunks -= extent.chunks as usize;
    }

    /// Release a previously allocated run
    pub fn free(&mut self, extent: Extent) -> Result<()> {
        if extent.end() as usize > self.total_chunks {
            return Err(CfstoreError::InvalidArgument(format!(
                "extent {:?} beyond {} chunks",
                extent, self.total_chunks
            )));
        }

        for chunk in extent.start as usize..extent.end() as usize {
            if !self.is_allocated(chunk as u32) {
                tracing::warn!("Double-free detected for chunk {}", chunk);
                continue;
            }
            self.set(chunk, false);
            self.free_chunks += 1;
        }
        Ok(())
    }
}
