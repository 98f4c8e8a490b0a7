//! Config store engine
//!
//! [`ConfigStore`] owns one storage medium, the namespace index rebuilt from
//! it at startup and the table of open handles. Every operation takes either
//! the caller's [`SecurityContext`] or a handle issued to one.
//!
//! Writes never touch bytes an older generation owns: a handle that writes
//! builds a new generation beside the live one and makes it live when the
//! handle is closed.

use crate::acl::{self, ContextRegistry, KeyPattern, Operation, SecurityContext};
use crate::allocator::{chunks_for, ChunkBitmap, Extent};
use crate::catalog::{Generation, NamespaceIndex};
use crate::config::StoreConfig;
use crate::cursor::{Handle, HandleTable, ReadCursor, Whence};
use crate::error::{CfstoreError, Result, Status};
use crate::flags::{Acl, DataRetentionLevel, Ddsp, KeyMode, Permissions};
use crate::fragment::{FragmentCache, Fragments, Reassembly};
use crate::io::{StorageDescriptor, StorageMedium};
use crate::record::{encoded_len, CHUNK_SIZE};
use crate::recovery::{self, RecoverySummary};
use crate::validation::KeyName;
use crate::writer::{self, Layout, PendingWrite, WriteOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attributes and mode for opening or creating a key
///
/// Only `mode` matters when opening an existing key; the other fields are
/// fixed when the key is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDescriptor {
    pub acl: Acl,
    /// Retention the key expects from its medium
    pub drl: DataRetentionLevel,
    /// Protection the key asks the medium for
    pub ddsp: Ddsp,
    /// Byte offset used with `ALLOC_AT_OFFSET`, chunk aligned
    pub offset_address: Option<u64>,
    /// Value bytes reserved up front for a contiguous key (0 grows on demand)
    pub reserve_len: u64,
    pub mode: KeyMode,
}

impl Default for KeyDescriptor {
    fn default() -> Self {
        KeyDescriptor {
            acl: Acl::OWNER_RW,
            drl: DataRetentionLevel::Volatile,
            ddsp: Ddsp::empty(),
            offset_address: None,
            reserve_len: 0,
            mode: KeyMode::empty(),
        }
    }
}

impl KeyDescriptor {
    /// Descriptor for creating a key with `acl`
    pub fn create(acl: Acl) -> Self {
        KeyDescriptor {
            acl,
            mode: KeyMode::CREATE,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: KeyMode) -> Self {
        self.mode |= mode;
        self
    }

    pub fn with_ddsp(mut self, ddsp: Ddsp) -> Self {
        self.ddsp = ddsp;
        self
    }

    pub fn with_drl(mut self, drl: DataRetentionLevel) -> Self {
        self.drl = drl;
        self
    }

    /// Reserve room for `len` value bytes in one contiguous record
    pub fn reserve(mut self, len: u64) -> Self {
        self.reserve_len = len;
        self
    }

    /// Place the record at byte `offset` of the medium
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset_address = Some(offset);
        self.mode |= KeyMode::ALLOC_AT_OFFSET;
        self
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            lazy: self.mode.contains(KeyMode::LAZY_FLUSH),
            block: self.mode.contains(KeyMode::BLOCK_WRITE),
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub live_keys: usize,
    pub open_handles: usize,
    /// Superseded generations not yet erased
    pub garbage_generations: usize,
    pub total_chunks: usize,
    pub free_chunks: usize,
    pub cached_fragments: usize,
}

struct OpenKey {
    ctx: SecurityContext,
    key: KeyName,
    /// Generation reads see; `None` until a key created by this handle commits
    snapshot: Option<Arc<Generation>>,
    cursor: ReadCursor,
    desc: KeyDescriptor,
    write: Option<PendingWrite>,
}

/// A configuration store on one medium
pub struct ConfigStore {
    fragments: Fragments,
    index: NamespaceIndex,
    handles: HandleTable<OpenKey>,
    contexts: ContextRegistry,
    config: StoreConfig,
    /// Detected media, the one in use first
    descriptors: Vec<StorageDescriptor>,
    summary: RecoverySummary,
}

impl ConfigStore {
    /// Mount a store, recovering whatever the medium holds
    pub fn mount(medium: Box<dyn StorageMedium>, config: StoreConfig) -> Result<Self> {
        Self::mount_with_descriptors(medium, config, Vec::new())
    }

    /// Mount a store that also reports `extra` media from [`storage_detect`](Self::storage_detect)
    pub fn mount_with_descriptors(
        mut medium: Box<dyn StorageMedium>,
        config: StoreConfig,
        extra: Vec<StorageDescriptor>,
    ) -> Result<Self> {
        config.validate()?;

        let capacity = medium.capacity();
        let mut image = vec![0u8; capacity as usize];
        medium.read(0, &mut image)?;
        let report = recovery::scan(&image);
        drop(image);
        let plan = recovery::plan(&report);

        let mut alloc = ChunkBitmap::new((capacity / CHUNK_SIZE as u64) as usize);
        for generation in &plan.live {
            for extent in generation.extents() {
                alloc.allocate_at(extent)?;
            }
        }

        let mut descriptors = vec![medium.descriptor().clone()];
        descriptors.extend(extra);

        let mut fragments = Fragments::new(
            medium,
            alloc,
            FragmentCache::new(config.read_cache_capacity),
        );
        for scanned in &plan.finalize {
            let mut record = scanned.record.clone();
            fragments.finalize_record(scanned.extent(), &mut record)?;
        }
        for extent in &plan.reclaim {
            fragments.erase(*extent)?;
        }
        if !plan.finalize.is_empty() || !plan.reclaim.is_empty() {
            fragments.sync()?;
        }

        let mut index = NamespaceIndex::with_versions(plan.max_versions);
        for generation in plan.live {
            index.commit(generation);
        }

        let summary = plan.summary;
        info!(
            "Config store opened: {} live keys, {} records scanned, {} finalized, {} reclaimed, {} corrupt slots",
            summary.live_keys,
            summary.records_scanned,
            summary.finalized_on_recovery,
            summary.reclaimed_generations,
            summary.corrupt_slots.len()
        );

        Ok(ConfigStore {
            fragments,
            index,
            handles: HandleTable::new(config.max_open_handles),
            contexts: ContextRegistry::new(),
            config,
            descriptors,
            summary,
        })
    }

    /// What recovery found when the store was opened
    pub fn recovery_summary(&self) -> &RecoverySummary {
        &self.summary
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live_keys: self.index.len(),
            open_handles: self.handles.len(),
            garbage_generations: self.index.garbage_len(),
            total_chunks: self.fragments.allocator().total_chunks(),
            free_chunks: self.fragments.allocator().free_chunks(),
            cached_fragments: self.fragments.cache().len(),
        }
    }

    pub fn register_context(&mut self, prefix: &str) -> Result<SecurityContext> {
        self.contexts.register(prefix)
    }

    /// Remove a context, closing every handle it still holds
    pub fn unregister_context(&mut self, ctx: &SecurityContext) -> Result<()> {
        self.contexts.verify(ctx)?;
        let id = ctx.id;
        for handle in self.handles.handles_where(|entry| entry.ctx.id == id) {
            self.close(handle)?;
        }
        self.contexts.unregister(id)?;
        debug!("Unregistered context {:?}", id);
        Ok(())
    }

    /// Open an existing key, or create one when `desc.mode` has `CREATE`
    ///
    /// Without `CREATE`, `key` may be a pattern; it must then resolve to
    /// exactly one key the context can see.
    pub fn open(
        &mut self,
        ctx: &SecurityContext,
        key: &str,
        desc: &KeyDescriptor,
    ) -> Result<Handle> {
        self.contexts.verify(ctx)?;
        if desc.mode.contains(KeyMode::CREATE) {
            return self.create(ctx, key, desc);
        }
        if desc.mode.contains(KeyMode::ALLOC_AT_OFFSET) {
            return Err(CfstoreError::InvalidArgument(
                "ALLOC_AT_OFFSET is only valid when creating a key".to_string(),
            ));
        }

        let generation = self.resolve(ctx, key)?;
        let advisory = generation.permissions.ddsp.unmet_by(self.medium_ddsp());
        if !advisory.is_empty() {
            warn!(
                "Key '{}' requests protection {:?} the medium does not provide",
                generation.key, advisory
            );
        }

        let handle = self.handles.insert(OpenKey {
            ctx: ctx.clone(),
            key: generation.key.clone(),
            snapshot: Some(generation),
            cursor: ReadCursor::default(),
            desc: desc.clone(),
            write: None,
        })?;
        debug!("Opened '{}' as {:?}", key, handle);
        Ok(handle)
    }

    fn create(&mut self, ctx: &SecurityContext, key: &str, desc: &KeyDescriptor) -> Result<Handle> {
        let name = KeyName::new(key)?;
        desc.acl.validate()?;
        if !ctx.owns(name.as_str()) {
            return Err(CfstoreError::PermissionDenied(format!(
                "context '{}' does not own '{}'",
                ctx.prefix, name
            )));
        }
        if self.index.get(name.as_str()).is_some() {
            return Err(CfstoreError::AlreadyExists(name.into_string()));
        }
        if self.index.writer(name.as_str()).is_some() {
            return Err(CfstoreError::WriteInProgress(name.into_string()));
        }

        let medium = self.fragments.medium().descriptor();
        if desc.drl > medium.drl {
            warn!(
                "Key '{}' expects retention {:?} but the medium offers {:?}",
                name, desc.drl, medium.drl
            );
        }
        let advisory = desc.ddsp.unmet_by(medium.ddsp);
        if !advisory.is_empty() {
            warn!(
                "Key '{}' requests protection {:?} the medium does not provide",
                name, advisory
            );
        }

        let handle = self.handles.insert(OpenKey {
            ctx: ctx.clone(),
            key: name.clone(),
            snapshot: None,
            cursor: ReadCursor::default(),
            desc: desc.clone(),
            write: None,
        })?;
        let layout = match layout_for(
            &mut self.fragments,
            &mut self.index,
            &self.config,
            &name,
            desc,
            desc.acl,
        ) {
            Ok(layout) => layout,
            Err(e) => {
                self.handles.remove(handle)?;
                return Err(e);
            }
        };

        let version = self.index.next_version(&name);
        self.index.claim_writer(&name, handle)?;
        self.index.note_version(&name, version);
        debug!("Creating '{}' v{} as {:?} ({:?})", name, version, handle, layout);

        let permissions = Permissions::new(desc.acl, desc.ddsp);
        let entry = self.handles.get_mut(handle)?;
        entry.write = Some(PendingWrite::new(
            name,
            version,
            permissions,
            layout,
            desc.write_options(),
        ));
        Ok(handle)
    }

    /// Resolve a name or pattern to the one live generation it denotes
    fn resolve(&self, ctx: &SecurityContext, key: &str) -> Result<Arc<Generation>> {
        let pattern = KeyPattern::parse(key)?;
        let available = self.medium_ddsp();

        if pattern.is_exact() {
            let name = KeyName::new(key)?;
            let generation = match self.index.get(name.as_str()) {
                Some(generation) => generation.clone(),
                None if self.index.writer(name.as_str()).is_some() => {
                    return Err(CfstoreError::NotFinalized(name.into_string()))
                }
                None => return Err(CfstoreError::NotFound(name.into_string())),
            };
            require(ctx, &generation, Operation::Open, available)?;
            return Ok(generation);
        }

        let visible: Vec<&Arc<Generation>> = self
            .index
            .matches(&pattern, None)
            .filter(|g| {
                acl::check(ctx, g.key.as_str(), g.permissions, Operation::Open, available).allowed()
            })
            .collect();
        match visible.as_slice() {
            [] => Err(CfstoreError::NotFound(key.to_string())),
            [only] => Ok(Arc::clone(only)),
            many => Err(CfstoreError::AmbiguousMatch {
                pattern: key.to_string(),
                matches: many.len(),
            }),
        }
    }

    /// Read from the handle's cursor into `buf`
    ///
    /// Returns the bytes copied and [`Status::More`] while bytes remain.
    pub fn read(&mut self, handle: Handle, buf: &mut [u8]) -> Result<(usize, Status)> {
        let available = self.medium_ddsp();
        let entry = self.handles.get_mut(handle)?;
        let generation = entry
            .snapshot
            .clone()
            .ok_or_else(|| CfstoreError::NotFinalized(entry.key.to_string()))?;
        require(&entry.ctx, &generation, Operation::Read, available)?;

        let len = generation.value_len();
        let remaining = entry.cursor.remaining(len);
        if remaining == 0 {
            return Ok((0, Status::Success));
        }
        if buf.is_empty() {
            return Err(CfstoreError::BufferTooSmall { remaining });
        }

        let chunk = self
            .fragments
            .read_range(&generation, entry.cursor.position(), buf.len());
        let n = chunk.bytes.len();
        buf[..n].copy_from_slice(&chunk.bytes);
        entry.cursor.advance(n as u64);

        if n == 0 {
            if let Some(delivered) = chunk.truncated_at {
                return Err(CfstoreError::Truncated { delivered });
            }
        }
        let status = if entry.cursor.remaining(len) > 0 {
            Status::More
        } else {
            Status::Success
        };
        Ok((n, status))
    }

    /// Move the read cursor; returns the new absolute position
    pub fn rseek(&mut self, handle: Handle, offset: u64, whence: Whence) -> Result<u64> {
        let entry = self.handles.get_mut(handle)?;
        let len = entry
            .snapshot
            .as_ref()
            .map(|g| g.value_len())
            .ok_or_else(|| CfstoreError::NotFinalized(entry.key.to_string()))?;
        entry.cursor.seek(offset, whence, len)
    }

    /// Append `data` to the generation the handle is writing
    ///
    /// `offset` must equal the number of bytes the handle has written so
    /// far. The first write through a handle opened on an existing key
    /// starts a new generation of that key.
    pub fn write(&mut self, handle: Handle, data: &[u8], offset: u64) -> Result<usize> {
        let available = self.medium_ddsp();
        let entry = self.handles.get_mut(handle)?;

        if entry.write.is_none() {
            let snapshot = entry.snapshot.clone().ok_or(CfstoreError::InvalidHandle)?;
            require(&entry.ctx, &snapshot, Operation::Write, available)?;
            self.index.claim_writer(&entry.key, handle)?;
            let layout = match layout_for(
                &mut self.fragments,
                &mut self.index,
                &self.config,
                &entry.key,
                &entry.desc,
                snapshot.permissions.acl,
            ) {
                Ok(layout) => layout,
                Err(e) => {
                    self.index.release_writer(entry.key.as_str(), handle);
                    return Err(e);
                }
            };
            let version = self.index.next_version(&entry.key);
            self.index.note_version(&entry.key, version);
            debug!(
                "Updating '{}' v{} -> v{} via {:?}",
                entry.key, snapshot.version, version, handle
            );
            entry.write = Some(PendingWrite::new(
                entry.key.clone(),
                version,
                snapshot.permissions,
                layout,
                entry.desc.write_options(),
            ));
        }

        let Some(pending) = entry.write.as_mut() else {
            return Err(CfstoreError::InvalidHandle);
        };
        if offset != pending.position() {
            return Err(CfstoreError::InvalidArgument(format!(
                "write at offset {} but the handle has written {} bytes",
                offset,
                pending.position()
            )));
        }
        pending.write(&mut self.fragments, &mut self.index, &self.config, data)
    }

    /// Push lazily buffered data to the medium and sync it
    pub fn flush(&mut self, handle: Handle) -> Result<()> {
        let entry = self.handles.get_mut(handle)?;
        if let Some(pending) = entry.write.as_mut() {
            pending.flush(&mut self.fragments, &mut self.index, &self.config)?;
        }
        self.fragments.sync()
    }

    /// Close a handle, committing anything it wrote
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let entry = self.handles.remove(handle)?;
        self.finish(handle, entry)
    }

    fn finish(&mut self, handle: Handle, entry: OpenKey) -> Result<()> {
        let Some(pending) = entry.write else {
            debug!("Closed {:?} on '{}'", handle, entry.key);
            return Ok(());
        };

        let committed = pending.commit(&mut self.fragments, &mut self.index, &self.config);
        self.index.release_writer(entry.key.as_str(), handle);
        let generation = self.index.commit(committed?);
        if self.config.sync_on_close {
            self.fragments.sync()?;
        }
        debug!(
            "Committed '{}' v{} ({} bytes in {} fragment(s))",
            generation.key,
            generation.version,
            generation.value_len(),
            generation.fragments.len()
        );
        Ok(())
    }

    /// Drop a handle without committing what it wrote
    fn abandon(&mut self, handle: Handle) -> Result<()> {
        let entry = self.handles.remove(handle)?;
        if let Some(pending) = entry.write {
            self.index.release_writer(entry.key.as_str(), handle);
            pending.discard(&mut self.fragments)?;
        }
        Ok(())
    }

    /// Next key matching `pattern` that the context may see
    ///
    /// Pass the handle returned by the previous call to continue the
    /// enumeration; that handle is closed. It must belong to `ctx`, otherwise
    /// the call fails with `InvalidHandle` and the handle stays open. Keys
    /// are visited in byte order.
    pub fn find(
        &mut self,
        ctx: &SecurityContext,
        pattern: &str,
        previous: Option<Handle>,
    ) -> Result<Option<Handle>> {
        self.contexts.verify(ctx)?;
        let pattern = KeyPattern::parse(pattern)?;

        let after = match previous {
            Some(prev) => {
                if self.handles.get(prev)?.ctx.id != ctx.id {
                    return Err(CfstoreError::InvalidHandle);
                }
                let entry = self.handles.remove(prev)?;
                let key = entry.key.clone();
                self.finish(prev, entry)?;
                Some(key)
            }
            None => None,
        };

        let found = self
            .index
            .matches(&pattern, after.as_ref().map(KeyName::as_str))
            .find(|g| ctx.owns(g.key.as_str()) || g.permissions.acl.contains(Acl::OTHER_READ))
            .cloned();
        let Some(generation) = found else {
            debug!("find '{}' exhausted", pattern);
            return Ok(None);
        };

        let handle = self.handles.insert(OpenKey {
            ctx: ctx.clone(),
            key: generation.key.clone(),
            snapshot: Some(generation),
            cursor: ReadCursor::default(),
            desc: KeyDescriptor::default(),
            write: None,
        })?;
        Ok(Some(handle))
    }

    /// Delete every owned key matching `pattern`; returns how many were deleted
    ///
    /// Handles on deleted keys become invalid and their pending writes are
    /// discarded.
    pub fn delete(&mut self, ctx: &SecurityContext, pattern: &str) -> Result<usize> {
        self.contexts.verify(ctx)?;
        let parsed = KeyPattern::parse(pattern)?;

        let mut keys: Vec<KeyName> = self
            .index
            .matches(&parsed, None)
            .map(|g| g.key.clone())
            .collect();
        // Keys whose first generation is still being written
        for handle in self
            .handles
            .handles_where(|e| e.snapshot.is_none() && parsed.matches(e.key.as_str()))
        {
            let key = self.handles.get(handle)?.key.clone();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let (owned, foreign): (Vec<KeyName>, Vec<KeyName>) =
            keys.into_iter().partition(|k| ctx.owns(k.as_str()));
        if owned.is_empty() {
            if parsed.is_exact() && !foreign.is_empty() {
                return Err(CfstoreError::PermissionDenied(format!(
                    "context '{}' does not own '{}'",
                    ctx.prefix, pattern
                )));
            }
            return Err(CfstoreError::NotFound(pattern.to_string()));
        }

        for key in &owned {
            self.delete_key(key)?;
        }
        self.fragments.sync()?;
        info!("Deleted {} key(s) matching '{}'", owned.len(), pattern);
        Ok(owned.len())
    }

    fn delete_key(&mut self, key: &KeyName) -> Result<()> {
        for handle in self.handles.handles_where(|e| e.key == *key) {
            self.abandon(handle)?;
        }
        for generation in self.index.remove(key.as_str()) {
            for extent in generation.erase_order() {
                self.fragments.release(extent)?;
            }
        }
        debug!("Deleted '{}'", key);
        Ok(())
    }

    /// Iterate detected storage, starting with the medium in use
    ///
    /// Pass the descriptor returned by the previous call to get the next
    /// one. [`Status::More`] means further descriptors remain.
    pub fn storage_detect(
        &self,
        previous: Option<&StorageDescriptor>,
    ) -> Result<(StorageDescriptor, Status)> {
        let next = match previous {
            None => 0,
            Some(prev) => {
                self.descriptors
                    .iter()
                    .position(|d| d.id == prev.id)
                    .ok_or_else(|| CfstoreError::NotFound(format!("storage {}", prev.id)))?
                    + 1
            }
        };
        let descriptor = self
            .descriptors
            .get(next)
            .cloned()
            .ok_or_else(|| CfstoreError::NotFound("no further storage".to_string()))?;
        let status = if next + 1 < self.descriptors.len() {
            Status::More
        } else {
            Status::Success
        };
        Ok((descriptor, status))
    }

    pub fn key_name(&self, handle: Handle) -> Result<&KeyName> {
        Ok(&self.handles.get(handle)?.key)
    }

    /// Length of the value the handle reads
    pub fn value_len(&self, handle: Handle) -> Result<u64> {
        let entry = self.handles.get(handle)?;
        entry
            .snapshot
            .as_ref()
            .map(|g| g.value_len())
            .ok_or_else(|| CfstoreError::NotFinalized(entry.key.to_string()))
    }

    /// Version of the generation the handle reads
    pub fn key_version(&self, handle: Handle) -> Result<u32> {
        let entry = self.handles.get(handle)?;
        entry
            .snapshot
            .as_ref()
            .map(|g| g.version)
            .ok_or_else(|| CfstoreError::NotFinalized(entry.key.to_string()))
    }

    /// Create or replace `key` with `value` in one step
    ///
    /// `desc` supplies the attributes when the key does not exist yet.
    pub fn put(
        &mut self,
        ctx: &SecurityContext,
        key: &str,
        value: &[u8],
        desc: &KeyDescriptor,
    ) -> Result<()> {
        self.contexts.verify(ctx)?;
        let name = KeyName::new(key)?;

        let mut desc = desc.clone();
        desc.mode.remove(KeyMode::BLOCK_WRITE);
        if self.index.get(name.as_str()).is_some() {
            desc.mode.remove(KeyMode::CREATE | KeyMode::ALLOC_AT_OFFSET);
        } else {
            desc.mode.insert(KeyMode::CREATE);
        }

        let handle = self.open(ctx, key, &desc)?;
        match self.write(handle, value, 0) {
            Ok(written) if written == value.len() => self.close(handle),
            Ok(written) => {
                self.abandon(handle)?;
                Err(CfstoreError::StorageExhausted {
                    needed: (value.len() - written) as u64,
                })
            }
            Err(e) => {
                self.abandon(handle)?;
                Err(e)
            }
        }
    }

    /// Read the whole current value of `key`
    pub fn get(&mut self, ctx: &SecurityContext, key: &str) -> Result<Reassembly> {
        let handle = self.open(ctx, key, &KeyDescriptor::default())?;
        let result = self.read_all(handle);
        self.close(handle)?;
        result
    }

    fn read_all(&mut self, handle: Handle) -> Result<Reassembly> {
        let available = self.medium_ddsp();
        let entry = self.handles.get(handle)?;
        let generation = entry
            .snapshot
            .clone()
            .ok_or_else(|| CfstoreError::NotFinalized(entry.key.to_string()))?;
        require(&entry.ctx, &generation, Operation::Read, available)?;
        Ok(self
            .fragments
            .read_range(&generation, 0, generation.value_len() as usize))
    }

    /// Erase superseded generations no handle still reads; returns bytes freed
    pub fn reclaim(&mut self) -> Result<u64> {
        let chunks = writer::reclaim_garbage(&mut self.fragments, &mut self.index)?;
        if chunks > 0 {
            self.fragments.sync()?;
            debug!("Reclaimed {} chunks", chunks);
        }
        Ok(chunks * CHUNK_SIZE as u64)
    }

    /// Close every open handle, committing pending writes, and sync
    pub fn shutdown(mut self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles.handles_where(|_| true) {
            if let Err(e) = self.close(handle) {
                warn!("Failed to close {:?} during shutdown: {}", handle, e);
                first_error.get_or_insert(e);
            }
        }
        self.fragments.sync()?;
        info!("Config store shut down with {} live keys", self.index.len());
        first_error.map_or(Ok(()), Err)
    }

    fn medium_ddsp(&self) -> Ddsp {
        self.fragments.medium().descriptor().ddsp
    }
}

fn require(
    ctx: &SecurityContext,
    generation: &Generation,
    op: Operation,
    available: Ddsp,
) -> Result<()> {
    if acl::check(ctx, generation.key.as_str(), generation.permissions, op, available).allowed() {
        Ok(())
    } else {
        Err(CfstoreError::PermissionDenied(format!(
            "{:?} on '{}' denied to context '{}'",
            op, generation.key, ctx.prefix
        )))
    }
}

/// Pick the layout of a new generation, reserving space when asked to
fn layout_for(
    fragments: &mut Fragments,
    index: &mut NamespaceIndex,
    config: &StoreConfig,
    key: &KeyName,
    desc: &KeyDescriptor,
    acl: Acl,
) -> Result<Layout> {
    let contiguous = desc
        .mode
        .intersects(KeyMode::CONTINUOUS | KeyMode::ALLOC_AT_OFFSET)
        || acl.is_executable();
    if !contiguous {
        return Ok(Layout::Chained);
    }

    let capacity = fragments.medium().capacity();
    if desc.reserve_len > capacity {
        return Err(CfstoreError::StorageExhausted {
            needed: desc.reserve_len,
        });
    }
    let chunks = chunks_for(encoded_len(key.as_str().len(), desc.reserve_len as usize));

    let reservation = if desc.mode.contains(KeyMode::ALLOC_AT_OFFSET) {
        let offset = desc.offset_address.ok_or_else(|| {
            CfstoreError::InvalidArgument("ALLOC_AT_OFFSET requires offset_address".to_string())
        })?;
        if desc.reserve_len == 0 || offset % CHUNK_SIZE as u64 != 0 || offset >= capacity {
            return Err(CfstoreError::InvalidArgument(format!(
                "fixed-offset allocation needs reserve_len and a chunk-aligned offset inside the medium (offset {}, reserve_len {})",
                offset, desc.reserve_len
            )));
        }
        let extent = Extent::new((offset / CHUNK_SIZE as u64) as u32, chunks);
        Some(fragments.allocate_at(extent)?)
    } else if desc.reserve_len > 0 {
        Some(writer::allocate(fragments, index, config, chunks)?)
    } else {
        None
    };
    Ok(Layout::Contiguous { reservation })
}
