//! Startup recovery
//!
//! Recovery is two pure steps over a raw medium image:
//!
//! 1. [`scan`] walks the image slot by slot and classifies every slot as a
//!    record, erased space, a torn write or corruption.
//! 2. [`plan`] groups records into generations, walks each generation's
//!    fragment chain and decides what becomes live, what must be finalized
//!    and what is reclaimed.
//!
//! Neither step touches a medium, so both can be exercised on synthetic
//! images. The store applies the resulting [`RecoveryPlan`].

use crate::allocator::Extent;
use crate::catalog::{FragmentRef, Generation};
use crate::error::CorruptionKind;
use crate::record::{self, FragmentLink, Record, Slot, CHUNK_SIZE};
use crate::validation::KeyName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A decoded record and where it sits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    pub offset: u64,
    pub record: Record,
}

impl ScannedRecord {
    pub fn extent(&self) -> Extent {
        Extent::from_bytes(self.offset, self.record.encoded_len())
    }

    pub fn chunk(&self) -> u32 {
        (self.offset / CHUNK_SIZE as u64) as u32
    }
}

/// A slot that failed to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptSlot {
    pub offset: u64,
    pub len: u64,
    pub kind: CorruptionKind,
}

/// Everything found by a linear scan of the image
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub records: Vec<ScannedRecord>,
    pub corrupt: Vec<CorruptSlot>,
    /// Records whose header was written but whose tail never landed
    pub torn: Vec<Extent>,
    pub capacity: u64,
}

/// Classify every slot of `image`
///
/// Corruption of one slot never stops the scan: a slot whose header is
/// trustworthy is skipped by its declared size, otherwise by one chunk.
pub fn scan(image: &[u8]) -> ScanReport {
    let mut report = ScanReport {
        capacity: image.len() as u64,
        ..Default::default()
    };

    let mut pos = 0usize;
    while pos + CHUNK_SIZE <= image.len() {
        let window = &image[pos..];
        let advance = match record::decode(window) {
            Ok(Slot::Record(record)) => {
                let len = record.encoded_len();
                report.records.push(ScannedRecord {
                    offset: pos as u64,
                    record,
                });
                len
            }
            Ok(Slot::Erased { len }) => {
                if len > CHUNK_SIZE {
                    report.torn.push(Extent::from_bytes(pos as u64, len));
                }
                len
            }
            Err(kind) => {
                let len = match kind {
                    CorruptionKind::TailChecksum | CorruptionKind::SizeMismatch => {
                        record::trusted_size(window)
                            .filter(|&size| size > 0)
                            .map_or(CHUNK_SIZE, |size| size.min(window.len()))
                    }
                    CorruptionKind::Truncated => window.len() / CHUNK_SIZE * CHUNK_SIZE,
                    CorruptionKind::HeaderChecksum | CorruptionKind::Layout => CHUNK_SIZE,
                };
                tracing::warn!(
                    "Corrupt slot at offset {} ({}), skipping {} bytes",
                    pos,
                    kind,
                    len
                );
                report.corrupt.push(CorruptSlot {
                    offset: pos as u64,
                    len: len as u64,
                    kind,
                });
                len
            }
        };
        pos += advance.max(CHUNK_SIZE);
    }

    report
}

/// What the store must do to the medium to finish recovery
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    /// Generation each surviving key resolves to
    pub live: Vec<Generation>,
    /// Records to finalize in place, with their current contents
    pub finalize: Vec<ScannedRecord>,
    /// Extents to erase and return to the allocator
    pub reclaim: Vec<Extent>,
    /// Highest version seen per key, reclaimed generations included
    pub max_versions: HashMap<KeyName, u32>,
    pub summary: RecoverySummary,
}

/// Serializable account of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub records_scanned: usize,
    pub live_keys: usize,
    pub finalized_on_recovery: usize,
    pub reclaimed_generations: usize,
    pub torn_writes: usize,
    pub corrupt_slots: Vec<CorruptSlot>,
    pub reclaimed_bytes: u64,
}

impl RecoverySummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

enum ChainState {
    /// Every fragment finalized
    Complete(Vec<usize>),
    /// Terminal fragment finalized, earlier ones still need their flag
    Finishing(Vec<usize>),
    Broken,
}

/// Walk one generation's chain from its unique head
fn walk_chain(records: &[ScannedRecord], members: &[usize]) -> ChainState {
    let by_chunk: HashMap<u32, usize> = members.iter().map(|&i| (records[i].chunk(), i)).collect();
    if by_chunk.len() != members.len() {
        return ChainState::Broken;
    }

    let referenced: HashSet<u32> = members
        .iter()
        .filter_map(|&i| match records[i].record.next {
            FragmentLink::At(chunk) => Some(chunk),
            FragmentLink::Last => None,
        })
        .collect();
    let heads: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&i| !referenced.contains(&records[i].chunk()))
        .collect();
    if heads.len() != 1 {
        return ChainState::Broken;
    }

    let mut order = Vec::with_capacity(members.len());
    let mut visited = HashSet::new();
    let mut current = heads[0];
    loop {
        if !visited.insert(current) {
            return ChainState::Broken;
        }
        order.push(current);
        match records[current].record.next {
            FragmentLink::Last => break,
            FragmentLink::At(chunk) => match by_chunk.get(&chunk) {
                Some(&next) => current = next,
                None => return ChainState::Broken,
            },
        }
    }
    if order.len() != members.len() {
        return ChainState::Broken;
    }

    let terminal = order[order.len() - 1];
    if !records[terminal].record.is_finalized() {
        return ChainState::Broken;
    }
    if order.iter().all(|&i| records[i].record.is_finalized()) {
        ChainState::Complete(order)
    } else {
        ChainState::Finishing(order)
    }
}

/// Decide the fate of every scanned record
pub fn plan(report: &ScanReport) -> RecoveryPlan {
    let records = &report.records;
    let mut plan = RecoveryPlan::default();

    let mut generations: BTreeMap<(KeyName, u32), Vec<usize>> = BTreeMap::new();
    for (i, scanned) in records.iter().enumerate() {
        generations
            .entry((scanned.record.key.clone(), scanned.record.version))
            .or_default()
            .push(i);
        let max = plan
            .max_versions
            .entry(scanned.record.key.clone())
            .or_insert(0);
        *max = (*max).max(scanned.record.version);
    }

    // Highest complete candidate per key; BTreeMap order visits versions ascending
    let mut candidates: BTreeMap<KeyName, (u32, Vec<usize>, bool)> = BTreeMap::new();
    let mut reclaim_records: Vec<usize> = Vec::new();

    for ((key, version), members) in &generations {
        match walk_chain(records, members) {
            ChainState::Complete(order) => {
                if let Some((_, old, _)) = candidates.insert(key.clone(), (*version, order, false)) {
                    reclaim_records.extend(old);
                    plan.summary.reclaimed_generations += 1;
                }
            }
            ChainState::Finishing(order) => {
                if let Some((_, old, _)) = candidates.insert(key.clone(), (*version, order, true)) {
                    reclaim_records.extend(old);
                    plan.summary.reclaimed_generations += 1;
                }
            }
            ChainState::Broken => {
                tracing::debug!("Discarding incomplete generation {} v{}", key, version);
                reclaim_records.extend(members.iter().copied());
                plan.summary.reclaimed_generations += 1;
            }
        }
    }

    for (key, (version, order, finishing)) in candidates {
        if finishing {
            for &i in &order {
                if !records[i].record.is_finalized() {
                    plan.finalize.push(records[i].clone());
                }
            }
        }
        let head = &records[order[0]].record;
        plan.live.push(Generation {
            key,
            version,
            permissions: head.permissions,
            fragments: order
                .iter()
                .map(|&i| FragmentRef {
                    extent: records[i].extent(),
                    value_len: records[i].record.value.len() as u32,
                })
                .collect(),
        });
    }

    reclaim_records.sort_unstable();
    plan.reclaim
        .extend(reclaim_records.iter().map(|&i| records[i].extent()));
    plan.reclaim.extend(report.torn.iter().copied());
    plan.reclaim.extend(
        report
            .corrupt
            .iter()
            .map(|slot| Extent::from_bytes(slot.offset, slot.len as usize)),
    );

    plan.summary.records_scanned = records.len();
    plan.summary.live_keys = plan.live.len();
    plan.summary.finalized_on_recovery = plan.finalize.len();
    plan.summary.torn_writes = report.torn.len();
    plan.summary.corrupt_slots = report.corrupt.clone();
    plan.summary.reclaimed_bytes = plan.reclaim.iter().map(Extent::len).sum();
    plan
}
