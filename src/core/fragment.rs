//! Fragment I/O and reassembly
//!
//! [`Fragments`] owns the medium, the chunk allocator and a small LRU of
//! decoded records. Reads walk a generation's fragment chain and stop at
//! the first fragment that no longer decodes to what the index expects,
//! reporting how far the value could be reassembled.

use crate::allocator::{ChunkBitmap, Extent};
use crate::catalog::{FragmentRef, Generation};
use crate::error::{CfstoreError, CorruptionKind, Result};
use crate::io::StorageMedium;
use crate::record::{self, FragmentLink, Record, RecordFlags, Slot, CHUNK_SIZE, HEADER_SIZE, TAIL_SIZE};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// LRU of decoded records keyed by their first chunk
pub struct FragmentCache {
    lru: Option<LruCache<u32, Arc<Record>>>,
}

impl FragmentCache {
    /// A capacity of 0 disables caching
    pub fn new(capacity: usize) -> Self {
        FragmentCache {
            lru: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub fn get(&mut self, chunk: u32) -> Option<Arc<Record>> {
        self.lru.as_mut()?.get(&chunk).cloned()
    }

    pub fn put(&mut self, chunk: u32, record: Arc<Record>) {
        if let Some(lru) = self.lru.as_mut() {
            lru.put(chunk, record);
        }
    }

    /// Drop every entry starting inside `extent`
    pub fn invalidate(&mut self, extent: Extent) {
        if let Some(lru) = self.lru.as_mut() {
            let stale: Vec<u32> = lru
                .iter()
                .map(|(chunk, _)| *chunk)
                .filter(|chunk| *chunk >= extent.start && *chunk < extent.end())
                .collect();
            for chunk in stale {
                lru.pop(&chunk);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lru.as_ref().map_or(0, |lru| lru.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes recovered from a fragment chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    pub bytes: Vec<u8>,
    /// Value offset of the first fragment that could not be read
    pub truncated_at: Option<u64>,
}

impl Reassembly {
    pub fn is_complete(&self) -> bool {
        self.truncated_at.is_none()
    }

    /// The full value, or `Truncated` if the chain was broken
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.truncated_at {
            None => Ok(self.bytes),
            Some(_) => Err(CfstoreError::Truncated {
                delivered: self.bytes.len() as u64,
            }),
        }
    }
}

/// Medium-facing side of the store
pub struct Fragments {
    medium: Box<dyn StorageMedium>,
    alloc: ChunkBitmap,
    cache: FragmentCache,
}

impl Fragments {
    pub fn new(medium: Box<dyn StorageMedium>, alloc: ChunkBitmap, cache: FragmentCache) -> Self {
        Fragments {
            medium,
            alloc,
            cache,
        }
    }

    pub fn medium(&self) -> &dyn StorageMedium {
        self.medium.as_ref()
    }

    pub fn allocator(&self) -> &ChunkBitmap {
        &self.alloc
    }

    pub fn cache(&self) -> &FragmentCache {
        &self.cache
    }

    pub fn allocate(&mut self, chunks: u32) -> Result<Extent> {
        self.alloc.allocate(chunks)
    }

    pub fn allocate_at(&mut self, extent: Extent) -> Result<Extent> {
        self.alloc.allocate_at(extent)
    }

    pub fn try_extend(&mut self, extent: Extent, chunks: u32) -> Option<Extent> {
        self.alloc.try_extend(extent, chunks)
    }

    /// Return never-programmed chunks to the allocator
    pub fn free(&mut self, extent: Extent) -> Result<()> {
        self.alloc.free(extent)
    }

    /// Erase an extent the allocator does not track
    pub fn erase(&mut self, extent: Extent) -> Result<()> {
        self.cache.invalidate(extent);
        self.medium.erase(extent.offset(), extent.len())
    }

    /// Erase an extent and return it to the allocator
    pub fn release(&mut self, extent: Extent) -> Result<()> {
        self.erase(extent)?;
        self.alloc.free(extent)
    }

    /// Write a whole record at the start of `extent`
    pub fn program_record(&mut self, extent: Extent, record: &Record) -> Result<()> {
        self.cache.invalidate(extent);
        self.medium.program(extent.offset(), &record.encode())
    }

    /// Set the finalized flag by rewriting only the tail chunk
    pub fn finalize_record(&mut self, extent: Extent, record: &mut Record) -> Result<()> {
        record.flags |= RecordFlags::FINALIZED;
        let bytes = record.encode();
        let tail = record.tail_offset();
        self.cache.invalidate(extent);
        self.medium
            .program(extent.offset() + tail as u64, &bytes[tail..tail + TAIL_SIZE])
    }

    pub fn sync(&mut self) -> Result<()> {
        self.medium.sync()
    }

    /// Read and decode the record starting at `chunk`
    pub fn load(&mut self, chunk: u32) -> Result<Arc<Record>> {
        if let Some(record) = self.cache.get(chunk) {
            return Ok(record);
        }

        let offset = chunk as u64 * CHUNK_SIZE as u64;
        let corrupt = |kind| CfstoreError::Corruption { offset, kind };

        let mut header = [0u8; HEADER_SIZE];
        self.medium.read(offset, &mut header)?;
        let size = record::trusted_size(&header).ok_or(corrupt(CorruptionKind::Layout))?;
        if offset + size as u64 > self.medium.capacity() {
            return Err(corrupt(CorruptionKind::Truncated));
        }

        let mut bytes = vec![0u8; size];
        self.medium.read(offset, &mut bytes)?;
        match record::decode(&bytes) {
            Ok(Slot::Record(record)) => {
                let record = Arc::new(record);
                self.cache.put(chunk, record.clone());
                Ok(record)
            }
            Ok(Slot::Erased { .. }) => Err(corrupt(CorruptionKind::Layout)),
            Err(kind) => Err(corrupt(kind)),
        }
    }

    /// Load one fragment and check it is the one the index expects
    fn load_fragment(
        &mut self,
        generation: &Generation,
        fragment: &FragmentRef,
        next: FragmentLink,
    ) -> Result<Arc<Record>> {
        let record = self.load(fragment.extent.start)?;
        let consistent = record.key == generation.key
            && record.version == generation.version
            && record.is_finalized()
            && record.value.len() == fragment.value_len as usize
            && record.next == next;
        if !consistent {
            return Err(CfstoreError::Corruption {
                offset: fragment.extent.offset(),
                kind: CorruptionKind::Layout,
            });
        }
        Ok(record)
    }

    /// Reassemble `len` bytes of a generation's value starting at `pos`
    pub fn read_range(&mut self, generation: &Generation, pos: u64, len: usize) -> Reassembly {
        let end = pos.saturating_add(len as u64).min(generation.value_len());
        let mut bytes = Vec::with_capacity(end.saturating_sub(pos) as usize);

        let mut frag_start = 0u64;
        for (i, fragment) in generation.fragments.iter().enumerate() {
            let frag_end = frag_start + fragment.value_len as u64;
            if frag_start >= end {
                break;
            }
            if frag_end <= pos {
                frag_start = frag_end;
                continue;
            }

            let next = generation
                .fragments
                .get(i + 1)
                .map_or(FragmentLink::Last, |n| FragmentLink::At(n.extent.start));
            match self.load_fragment(generation, fragment, next) {
                Ok(record) => {
                    let from = (pos.max(frag_start) - frag_start) as usize;
                    let to = (end.min(frag_end) - frag_start) as usize;
                    bytes.extend_from_slice(&record.value[from..to]);
                }
                Err(e) => {
                    tracing::warn!(
                        "Fragment chain of '{}' v{} broken at value offset {}: {}",
                        generation.key,
                        generation.version,
                        frag_start,
                        e
                    );
                    return Reassembly {
                        bytes,
                        truncated_at: Some(frag_start.max(pos)),
                    };
                }
            }
            frag_start = frag_end;
        }

        Reassembly {
            bytes,
            truncated_at: None,
        }
    }
}
