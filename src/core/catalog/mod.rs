//! Namespace index
//!
//! Maps every key to its live (highest finalized version) generation and
//! keeps track of superseded generations that still occupy the medium.
//! Nothing here is persisted: the index is rebuilt from a recovery scan on
//! every startup.

use crate::acl::KeyPattern;
use crate::allocator::Extent;
use crate::cursor::Handle;
use crate::error::{CfstoreError, Result};
use crate::flags::Permissions;
use crate::validation::KeyName;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// One fragment of a committed generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub extent: Extent,
    pub value_len: u32,
}

/// A finalized, immutable generation of a key
///
/// Handles pin a generation by holding an `Arc` to it; superseded
/// generations are only erased once no handle pins them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub key: KeyName,
    pub version: u32,
    pub permissions: Permissions,
    /// Fragments in chain order, head first
    pub fragments: Vec<FragmentRef>,
}

impl Generation {
    pub fn value_len(&self) -> u64 {
        self.fragments.iter().map(|f| f.value_len as u64).sum()
    }

    pub fn extents(&self) -> impl Iterator<Item = Extent> + '_ {
        self.fragments.iter().map(|f| f.extent)
    }

    /// Extents in the order they must be erased: terminal fragment first
    ///
    /// An erase cut short then leaves a chain whose last surviving fragment
    /// links to erased space, which recovery reclaims as broken.
    pub fn erase_order(&self) -> impl Iterator<Item = Extent> + '_ {
        self.fragments.iter().rev().map(|f| f.extent)
    }
}

#[derive(Debug, Default)]
pub struct NamespaceIndex {
    live: BTreeMap<KeyName, Arc<Generation>>,
    /// Superseded generations still on the medium
    garbage: Vec<Arc<Generation>>,
    /// Handle currently writing a new generation of each key
    writers: HashMap<KeyName, Handle>,
    /// Highest version ever observed per key
    max_versions: HashMap<KeyName, u32>,
}

impl NamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed version bookkeeping from a recovery pass
    pub fn with_versions(max_versions: HashMap<KeyName, u32>) -> Self {
        NamespaceIndex {
            max_versions,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Generation>> {
        self.live.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyName> {
        self.live.keys()
    }

    /// Version for a key's next generation
    ///
    /// Strictly greater than every version seen for the key, including
    /// superseded and discarded generations.
    pub fn next_version(&self, key: &KeyName) -> u32 {
        let live = self.live.get(key).map_or(0, |g| g.version);
        let seen = self.max_versions.get(key).copied().unwrap_or(0);
        live.max(seen).saturating_add(1)
    }

    /// Record that `version` is now in use for `key`
    pub fn note_version(&mut self, key: &KeyName, version: u32) {
        let max = self.max_versions.entry(key.clone()).or_insert(0);
        *max = (*max).max(version);
    }

    /// Make `generation` live; the one it replaces becomes garbage
    pub fn commit(&mut self, generation: Generation) -> Arc<Generation> {
        self.note_version(&generation.key, generation.version);
        let generation = Arc::new(generation);
        if let Some(old) = self.live.insert(generation.key.clone(), generation.clone()) {
            tracing::debug!(
                "Generation {} v{} superseded by v{}",
                old.key,
                old.version,
                generation.version
            );
            self.garbage.push(old);
        }
        generation
    }

    /// Drop a key from the index, returning its generations oldest first
    ///
    /// The live generation comes last, so erasing in the returned order
    /// never leaves an older generation to win recovery on its own.
    pub fn remove(&mut self, key: &str) -> Vec<Arc<Generation>> {
        let (mut removed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.garbage)
            .into_iter()
            .partition(|g| g.key.as_str() == key);
        self.garbage = rest;
        removed.sort_by_key(|g| g.version);
        removed.extend(self.live.remove(key));
        removed
    }

    /// Claim the single writer slot of `key`
    pub fn claim_writer(&mut self, key: &KeyName, handle: Handle) -> Result<()> {
        match self.writers.get(key) {
            Some(&current) if current != handle => {
                Err(CfstoreError::WriteInProgress(key.to_string()))
            }
            _ => {
                self.writers.insert(key.clone(), handle);
                Ok(())
            }
        }
    }

    pub fn release_writer(&mut self, key: &str, handle: Handle) {
        if self.writers.get(key) == Some(&handle) {
            self.writers.remove(key);
        }
    }

    pub fn writer(&self, key: &str) -> Option<Handle> {
        self.writers.get(key).copied()
    }

    /// Live generations matching `pattern`, in key order, strictly after `after`
    pub fn matches<'a>(
        &'a self,
        pattern: &'a KeyPattern,
        after: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Arc<Generation>> + 'a {
        let start = match after {
            Some(after) if after >= pattern.prefix() => Bound::Excluded(after),
            _ => Bound::Included(pattern.prefix()),
        };
        self.live
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(move |(key, _)| !pattern.is_past(key.as_str()))
            .filter(move |(key, _)| pattern.matches(key.as_str()))
            .map(|(_, generation)| generation)
    }

    /// Remove and return superseded generations no handle still pins
    pub fn take_unpinned_garbage(&mut self) -> Vec<Arc<Generation>> {
        let (free, pinned): (Vec<_>, Vec<_>) = std::mem::take(&mut self.garbage)
            .into_iter()
            .partition(|g| Arc::strong_count(g) == 1);
        self.garbage = pinned;
        free
    }

    pub fn garbage_len(&self) -> usize {
        self.garbage.len()
    }
}
