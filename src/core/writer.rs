//! Write side of a generation
//!
//! A [`PendingWrite`] collects the fragments of one new generation while a
//! handle writes to it. Fragments are stored unfinalized as soon as data
//! arrives (unless the handle asked for lazy flushing) and are finalized
//! tail-first when the handle is closed.

use crate::allocator::{chunks_for, Extent};
use crate::catalog::{FragmentRef, Generation, NamespaceIndex};
use crate::config::StoreConfig;
use crate::error::{CfstoreError, Result};
use crate::flags::Permissions;
use crate::fragment::Fragments;
use crate::record::{encoded_len, FragmentLink, Record, CHUNK_SIZE};
use crate::validation::KeyName;

/// Allocate a contiguous run, reclaiming unpinned garbage once on exhaustion
pub fn allocate(
    fragments: &mut Fragments,
    index: &mut NamespaceIndex,
    config: &StoreConfig,
    chunks: u32,
) -> Result<Extent> {
    match fragments.allocate(chunks) {
        Err(CfstoreError::StorageExhausted { .. }) if config.reclaim_on_exhaustion => {
            let reclaimed = reclaim_garbage(fragments, index)?;
            tracing::debug!("Allocation of {} chunks retried after reclaiming {}", chunks, reclaimed);
            fragments.allocate(chunks)
        }
        other => other,
    }
}

/// Erase every superseded generation no handle pins; returns chunks freed
pub fn reclaim_garbage(fragments: &mut Fragments, index: &mut NamespaceIndex) -> Result<u64> {
    let mut freed = 0u64;
    for generation in index.take_unpinned_garbage() {
        for extent in generation.erase_order() {
            fragments.release(extent)?;
            freed += extent.chunks as u64;
        }
    }
    Ok(freed)
}

/// How the fragments of a generation are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Any number of linked fragments
    Chained,
    /// A single record, optionally in a pre-reserved extent
    Contiguous { reservation: Option<Extent> },
}

#[derive(Debug, Clone)]
struct PendingFragment {
    extent: Extent,
    record: Record,
}

/// Write options fixed when the generation starts
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub lazy: bool,
    pub block: bool,
}

#[derive(Debug)]
pub struct PendingWrite {
    key: KeyName,
    version: u32,
    permissions: Permissions,
    layout: Layout,
    options: WriteOptions,
    fragments: Vec<PendingFragment>,
    /// Bytes accepted so far, stored or buffered
    pos: u64,
    /// Lazily flushed bytes not yet on the medium
    buffer: Vec<u8>,
}

impl PendingWrite {
    pub fn new(
        key: KeyName,
        version: u32,
        permissions: Permissions,
        layout: Layout,
        options: WriteOptions,
    ) -> Self {
        PendingWrite {
            key,
            version,
            permissions,
            layout,
            options,
            fragments: Vec::new(),
            pos: 0,
            buffer: Vec::new(),
        }
    }

    pub fn key(&self) -> &KeyName {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Next offset the handle must write at
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Value bytes the reservation can still take
    fn capacity_left(&self) -> Option<u64> {
        match self.layout {
            Layout::Contiguous {
                reservation: Some(extent),
            } => Some(
                reservation_payload(self.key.as_str().len(), extent).saturating_sub(self.pos),
            ),
            _ => None,
        }
    }

    /// Accept `data` at the current position; returns the bytes taken
    pub fn write(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
        data: &[u8],
    ) -> Result<usize> {
        let mut take = data.len();
        if self.options.block {
            take = take / CHUNK_SIZE * CHUNK_SIZE;
        }
        if let Some(left) = self.capacity_left() {
            take = take.min(left as usize);
        }
        let data = &data[..take];

        if self.options.lazy {
            self.buffer.extend_from_slice(data);
        } else {
            self.store(fragments, index, config, data)?;
        }
        self.pos += take as u64;
        Ok(take)
    }

    /// Push lazily buffered bytes to the medium
    pub fn flush(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
    ) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        if let Err(e) = self.store(fragments, index, config, &data) {
            self.buffer = data;
            return Err(e);
        }
        Ok(())
    }

    fn store(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.layout {
            Layout::Chained => self.append_chain(fragments, index, config, data),
            Layout::Contiguous { reservation } => {
                self.rewrite_contiguous(fragments, index, config, reservation, data)
            }
        }
    }

    /// Store `data` as new fragments linked after the current terminal
    fn append_chain(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
        data: &[u8],
    ) -> Result<()> {
        let mut placed: Vec<PendingFragment> = Vec::new();
        for piece in data.chunks(config.fragment_payload_max) {
            let record = Record::new(self.key.clone(), piece.to_vec(), self.version, self.permissions);
            match allocate(fragments, index, config, chunks_for(record.encoded_len())) {
                Ok(extent) => placed.push(PendingFragment { extent, record }),
                Err(e) => {
                    for fragment in &placed {
                        fragments.free(fragment.extent)?;
                    }
                    return Err(e);
                }
            }
        }

        for i in 1..placed.len() {
            let next = placed[i].extent.start;
            placed[i - 1].record.next = FragmentLink::At(next);
        }
        for fragment in &placed {
            if let Err(e) = fragments.program_record(fragment.extent, &fragment.record) {
                for fragment in &placed {
                    fragments.release(fragment.extent)?;
                }
                return Err(e);
            }
        }

        // New fragments are on the medium; only now point the old terminal at them
        if let (Some(terminal), Some(first)) = (self.fragments.last_mut(), placed.first()) {
            terminal.record.next = FragmentLink::At(first.extent.start);
            fragments.program_record(terminal.extent, &terminal.record)?;
        }

        tracing::debug!(
            "Stored {} bytes of '{}' v{} in {} fragment(s)",
            data.len(),
            self.key,
            self.version,
            placed.len()
        );
        self.fragments.extend(placed);
        Ok(())
    }

    /// Grow the single record of a contiguous generation
    fn rewrite_contiguous(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
        reservation: Option<Extent>,
        data: &[u8],
    ) -> Result<()> {
        let current = self.fragments.pop();
        let mut value = current
            .as_ref()
            .map(|f| f.record.value.clone())
            .unwrap_or_default();
        value.extend_from_slice(data);
        let record = Record::new(self.key.clone(), value, self.version, self.permissions);
        let needed = chunks_for(record.encoded_len());

        let old_extent = current.as_ref().map(|f| f.extent);
        let extent = match (reservation, old_extent) {
            (Some(reserved), _) => reserved,
            (None, Some(old)) => match fragments.try_extend(old, needed) {
                Some(grown) => grown,
                None => return self.relocate(fragments, index, config, current, old, record),
            },
            (None, None) => allocate(fragments, index, config, needed)?,
        };

        if let Err(e) = fragments.program_record(extent, &record) {
            // Whatever the extent holds now belongs to this write until discard
            match current {
                Some(mut previous) => {
                    previous.extent = extent;
                    self.fragments.push(previous);
                }
                None if reservation.is_none() => fragments.free(extent)?,
                None => {}
            }
            return Err(e);
        }
        self.fragments.push(PendingFragment { extent, record });
        Ok(())
    }

    /// Move a contiguous record that cannot grow in place
    fn relocate(
        &mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
        current: Option<PendingFragment>,
        old: Extent,
        record: Record,
    ) -> Result<()> {
        let moved = match allocate(fragments, index, config, chunks_for(record.encoded_len())) {
            Ok(moved) => moved,
            Err(e) => {
                self.fragments.extend(current);
                return Err(e);
            }
        };
        if let Err(e) = fragments.program_record(moved, &record) {
            fragments.free(moved)?;
            self.fragments.extend(current);
            return Err(e);
        }

        self.fragments.push(PendingFragment {
            extent: moved,
            record,
        });
        fragments.release(old)?;
        tracing::debug!(
            "Relocated contiguous '{}' from chunk {} to {}",
            self.key,
            old.start,
            moved.start
        );
        Ok(())
    }

    /// Flush, finalize tail-first and describe the committed generation
    pub fn commit(
        mut self,
        fragments: &mut Fragments,
        index: &mut NamespaceIndex,
        config: &StoreConfig,
    ) -> Result<Generation> {
        self.flush(fragments, index, config)?;

        if self.fragments.is_empty() {
            let record = Record::new(self.key.clone(), Vec::new(), self.version, self.permissions);
            let extent = match self.layout {
                Layout::Contiguous {
                    reservation: Some(reserved),
                } => reserved,
                _ => allocate(fragments, index, config, chunks_for(record.encoded_len()))?,
            };
            fragments.program_record(extent, &record)?;
            self.fragments.push(PendingFragment { extent, record });
        }

        // The terminal fragment's flag is what recovery trusts, so it goes first
        for fragment in self.fragments.iter_mut().rev() {
            fragments.finalize_record(fragment.extent, &mut fragment.record)?;
        }

        let mut refs = Vec::with_capacity(self.fragments.len());
        for fragment in &self.fragments {
            let used = chunks_for(fragment.record.encoded_len());
            if used < fragment.extent.chunks {
                let unused = Extent::new(fragment.extent.start + used, fragment.extent.chunks - used);
                fragments.release(unused)?;
            }
            refs.push(FragmentRef {
                extent: Extent::new(fragment.extent.start, used),
                value_len: fragment.record.value.len() as u32,
            });
        }

        Ok(Generation {
            key: self.key,
            version: self.version,
            permissions: self.permissions,
            fragments: refs,
        })
    }

    /// Erase everything this generation put on the medium
    pub fn discard(self, fragments: &mut Fragments) -> Result<()> {
        let mut released = false;
        for fragment in self.fragments.iter().rev() {
            fragments.release(fragment.extent)?;
            released = true;
        }
        if let Layout::Contiguous {
            reservation: Some(reserved),
        } = self.layout
        {
            if !released {
                fragments.release(reserved)?;
            }
        }
        tracing::debug!("Discarded pending '{}' v{}", self.key, self.version);
        Ok(())
    }
}

/// Value bytes a contiguous record of `key_len` can hold in `extent`
pub fn reservation_payload(key_len: usize, extent: Extent) -> u64 {
    extent
        .len()
        .saturating_sub(encoded_len(key_len, 0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ChunkBitmap;
    use crate::flags::{Acl, Ddsp};
    use crate::fragment::FragmentCache;
    use crate::io::{MemoryMedium, SharedImage, StorageDescriptor, StorageMedium};
    use crate::recovery;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const CAPACITY: usize = 8192;

    fn setup() -> (Fragments, NamespaceIndex, StoreConfig, SharedImage) {
        let medium = MemoryMedium::new(CAPACITY);
        let image = medium.image();
        let fragments = Fragments::new(
            Box::new(medium),
            ChunkBitmap::new(CAPACITY / CHUNK_SIZE),
            FragmentCache::new(8),
        );
        let config = StoreConfig {
            fragment_payload_max: 32,
            ..Default::default()
        };
        (fragments, NamespaceIndex::new(), config, image)
    }

    fn pending(layout: Layout, options: WriteOptions) -> PendingWrite {
        PendingWrite::new(
            KeyName::new("a.k").unwrap(),
            1,
            Permissions::new(Acl::OWNER_RW, Ddsp::empty()),
            layout,
            options,
        )
    }

    #[test]
    fn test_chained_write_splits_by_payload_max() {
        let (mut fragments, mut index, config, _) = setup();
        let mut write = pending(Layout::Chained, WriteOptions::default());

        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(write.write(&mut fragments, &mut index, &config, &data).unwrap(), 100);
        assert_eq!(write.position(), 100);

        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();
        let lens: Vec<u32> = generation.fragments.iter().map(|f| f.value_len).collect();
        assert_eq!(lens, vec![32, 32, 32, 4]);

        let read = fragments.read_range(&generation, 0, 100);
        assert_eq!(read.bytes, data);
    }

    #[test]
    fn test_appends_relink_previous_terminal() {
        let (mut fragments, mut index, config, _) = setup();
        let mut write = pending(Layout::Chained, WriteOptions::default());

        write.write(&mut fragments, &mut index, &config, b"first ").unwrap();
        write.write(&mut fragments, &mut index, &config, b"second").unwrap();
        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();

        assert_eq!(generation.fragments.len(), 2);
        let read = fragments.read_range(&generation, 0, 64);
        assert!(read.is_complete());
        assert_eq!(read.bytes, b"first second");
    }

    #[test]
    fn test_uncommitted_write_is_invisible_to_recovery() {
        let (mut fragments, mut index, config, image) = setup();
        let mut write = pending(Layout::Chained, WriteOptions::default());
        write.write(&mut fragments, &mut index, &config, b"dangling").unwrap();

        let plan = recovery::plan(&recovery::scan(&image.snapshot()));
        assert!(plan.live.is_empty());
        assert_eq!(plan.reclaim.len(), 1);
    }

    #[test]
    fn test_committed_write_survives_recovery() {
        let (mut fragments, mut index, config, image) = setup();
        let mut write = pending(Layout::Chained, WriteOptions::default());
        write
            .write(&mut fragments, &mut index, &config, &[7u8; 70])
            .unwrap();
        write.commit(&mut fragments, &mut index, &config).unwrap();

        let plan = recovery::plan(&recovery::scan(&image.snapshot()));
        assert_eq!(plan.live.len(), 1);
        assert_eq!(plan.live[0].value_len(), 70);
        assert!(plan.finalize.is_empty());
    }

    #[test]
    fn test_lazy_write_buffers_until_flush() {
        let (mut fragments, mut index, config, image) = setup();
        let free_before = fragments.allocator().free_chunks();
        let options = WriteOptions {
            lazy: true,
            ..Default::default()
        };
        let mut write = pending(Layout::Chained, options);

        write.write(&mut fragments, &mut index, &config, b"lazy").unwrap();
        assert_eq!(fragments.allocator().free_chunks(), free_before);
        assert!(image.snapshot().iter().all(|&b| b == 0xFF));

        write.flush(&mut fragments, &mut index, &config).unwrap();
        assert!(fragments.allocator().free_chunks() < free_before);
    }

    #[test]
    fn test_block_write_stores_whole_chunks() {
        let (mut fragments, mut index, config, _) = setup();
        let options = WriteOptions {
            block: true,
            ..Default::default()
        };
        let mut write = pending(Layout::Chained, options);

        assert_eq!(write.write(&mut fragments, &mut index, &config, &[1; 40]).unwrap(), 32);
        assert_eq!(write.write(&mut fragments, &mut index, &config, &[1; 15]).unwrap(), 0);
        assert_eq!(write.position(), 32);
    }

    #[test]
    fn test_contiguous_grows_as_one_record() {
        let (mut fragments, mut index, config, _) = setup();
        let mut write = pending(Layout::Contiguous { reservation: None }, WriteOptions::default());

        write.write(&mut fragments, &mut index, &config, &[1; 50]).unwrap();
        write.write(&mut fragments, &mut index, &config, &[2; 50]).unwrap();
        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();

        assert_eq!(generation.fragments.len(), 1);
        assert_eq!(generation.value_len(), 100);
    }

    #[test]
    fn test_contiguous_relocates_when_blocked() {
        let (mut fragments, mut index, config, _) = setup();
        let mut write = pending(Layout::Contiguous { reservation: None }, WriteOptions::default());
        write.write(&mut fragments, &mut index, &config, &[1; 16]).unwrap();

        // Something else takes the chunks right after the record
        let blocker = fragments.allocate(2).unwrap();

        write.write(&mut fragments, &mut index, &config, &[2; 64]).unwrap();
        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();
        assert!(generation.fragments[0].extent.start > blocker.start);

        let read = fragments.read_range(&generation, 0, 80);
        assert_eq!(&read.bytes[..16], &[1; 16]);
        assert_eq!(&read.bytes[16..], &[2; 64]);
    }

    /// Memory medium whose programs fail while `failing` is set
    struct FlakyMedium {
        inner: MemoryMedium,
        failing: Arc<AtomicBool>,
    }

    impl StorageMedium for FlakyMedium {
        fn descriptor(&self) -> &StorageDescriptor {
            self.inner.descriptor()
        }

        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }

        fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read(offset, buf)
        }

        fn program(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "program failed").into());
            }
            self.inner.program(offset, data)
        }

        fn erase(&mut self, offset: u64, len: u64) -> Result<()> {
            self.inner.erase(offset, len)
        }

        fn sync(&mut self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_failed_relocation_keeps_old_record() {
        let failing = Arc::new(AtomicBool::new(false));
        let medium = FlakyMedium {
            inner: MemoryMedium::new(CAPACITY),
            failing: failing.clone(),
        };
        let mut fragments = Fragments::new(
            Box::new(medium),
            ChunkBitmap::new(CAPACITY / CHUNK_SIZE),
            FragmentCache::new(8),
        );
        let mut index = NamespaceIndex::new();
        let config = StoreConfig::default();
        let mut write = pending(Layout::Contiguous { reservation: None }, WriteOptions::default());
        write.write(&mut fragments, &mut index, &config, &[1; 16]).unwrap();
        let blocker = fragments.allocate(2).unwrap();
        let free_before = fragments.allocator().free_chunks();

        failing.store(true, Ordering::SeqCst);
        assert!(write.write(&mut fragments, &mut index, &config, &[2; 64]).is_err());
        assert_eq!(fragments.allocator().free_chunks(), free_before);
        assert_eq!(write.position(), 16);

        // The original record is still tracked, so discard frees it
        failing.store(false, Ordering::SeqCst);
        write.discard(&mut fragments).unwrap();
        fragments.free(blocker).unwrap();
        assert_eq!(fragments.allocator().free_chunks(), CAPACITY / CHUNK_SIZE);
    }

    #[test]
    fn test_reservation_truncates_and_trims() {
        let (mut fragments, mut index, config, _) = setup();
        let key_len = "a.k".len();
        let reserved = fragments
            .allocate(chunks_for(encoded_len(key_len, 64)))
            .unwrap();
        assert_eq!(reservation_payload(key_len, reserved), 64);

        let mut write = pending(
            Layout::Contiguous {
                reservation: Some(reserved),
            },
            WriteOptions::default(),
        );
        assert_eq!(write.write(&mut fragments, &mut index, &config, &[9; 40]).unwrap(), 40);
        assert_eq!(write.write(&mut fragments, &mut index, &config, &[9; 40]).unwrap(), 24);
        assert_eq!(write.write(&mut fragments, &mut index, &config, &[9; 1]).unwrap(), 0);

        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();
        assert_eq!(generation.value_len(), 64);
        assert_eq!(generation.fragments[0].extent, reserved);
    }

    #[test]
    fn test_reservation_unused_tail_is_released() {
        let (mut fragments, mut index, config, _) = setup();
        let reserved = fragments.allocate(20).unwrap();
        let mut write = pending(
            Layout::Contiguous {
                reservation: Some(reserved),
            },
            WriteOptions::default(),
        );
        write.write(&mut fragments, &mut index, &config, b"tiny").unwrap();
        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();

        // header 32 + key 16 + value 16 + tail 16
        assert_eq!(generation.fragments[0].extent, Extent::new(reserved.start, 5));
        assert_eq!(fragments.allocator().free_chunks(), CAPACITY / CHUNK_SIZE - 5);
    }

    #[test]
    fn test_empty_commit_stores_empty_value() {
        let (mut fragments, mut index, config, _) = setup();
        let write = pending(Layout::Chained, WriteOptions::default());
        let generation = write.commit(&mut fragments, &mut index, &config).unwrap();
        assert_eq!(generation.value_len(), 0);
        assert_eq!(generation.fragments.len(), 1);
    }

    #[test]
    fn test_discard_releases_everything() {
        let (mut fragments, mut index, config, image) = setup();
        let mut write = pending(Layout::Chained, WriteOptions::default());
        write.write(&mut fragments, &mut index, &config, &[3; 90]).unwrap();

        write.discard(&mut fragments).unwrap();
        assert_eq!(fragments.allocator().free_chunks(), CAPACITY / CHUNK_SIZE);
        assert!(image.snapshot().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_exhaustion_reclaims_unpinned_garbage() {
        let medium = MemoryMedium::new(256);
        let mut fragments = Fragments::new(
            Box::new(medium),
            ChunkBitmap::new(256 / CHUNK_SIZE),
            FragmentCache::new(0),
        );
        let mut index = NamespaceIndex::new();
        let config = StoreConfig::default();

        // Each generation of "a.k" with 40 bytes takes 7 chunks; 16 available
        for version in 1..=2 {
            let mut write = PendingWrite::new(
                KeyName::new("a.k").unwrap(),
                version,
                Permissions::new(Acl::OWNER_RW, Ddsp::empty()),
                Layout::Chained,
                WriteOptions::default(),
            );
            write.write(&mut fragments, &mut index, &config, &[0; 40]).unwrap();
            let generation = write.commit(&mut fragments, &mut index, &config).unwrap();
            index.commit(generation);
        }
        assert_eq!(fragments.allocator().free_chunks(), 2);

        let extent = allocate(&mut fragments, &mut index, &config, 7).unwrap();
        assert_eq!(extent.chunks, 7);
        assert_eq!(index.garbage_len(), 0);
    }
}
