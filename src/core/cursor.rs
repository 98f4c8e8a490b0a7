//! Handles and read cursors
//!
//! A [`Handle`] is a small `Copy` value naming a slot in a [`HandleTable`]
//! together with the slot's generation at the time it was issued. Closing
//! a handle bumps the slot generation, so stale copies are rejected with
//! `InvalidHandle` instead of reaching whatever reuses the slot.

use crate::error::{CfstoreError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Bounded table of open handles
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    open: usize,
}

impl<T> HandleTable<T> {
    pub fn new(capacity: usize) -> Self {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            open: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        self.open == 0
    }

    pub fn insert(&mut self, entry: T) -> Result<Handle> {
        if self.open >= self.capacity {
            return Err(CfstoreError::StorageExhausted { needed: 0 });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.open += 1;

        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(CfstoreError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(CfstoreError::InvalidHandle)
    }

    /// Close a handle, invalidating every copy of it
    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(CfstoreError::InvalidHandle)?;
        let entry = slot.entry.take().ok_or(CfstoreError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.open -= 1;
        Ok(entry)
    }

    /// Handles of every open entry matching `pred`
    pub fn handles_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Some(entry) if pred(entry) => Some(Handle {
                    index: index as u32,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Origin for [`rseek`](crate::ConfigStore::rseek)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    /// From the start of the value
    Set,
    /// From the current read position
    Cur,
    /// Backwards from the end of the value
    End,
}

/// Per-handle read position over a value of known length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    pos: u64,
}

impl ReadCursor {
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move the cursor; the target must lie within `0..=len`
    pub fn seek(&mut self, offset: u64, whence: Whence, len: u64) -> Result<u64> {
        let target = match whence {
            Whence::Set => Some(offset),
            Whence::Cur => self.pos.checked_add(offset),
            Whence::End => len.checked_sub(offset),
        };
        match target {
            Some(target) if target <= len => {
                self.pos = target;
                Ok(target)
            }
            _ => Err(CfstoreError::InvalidArgument(format!(
                "seek {:?}+{} outside value of {} bytes",
                whence, offset, len
            ))),
        }
    }

    pub fn advance(&mut self, n: u64) {
        self.pos += n;
    }

    pub fn remaining(&self, len: u64) -> u64 {
        len.saturating_sub(self.pos)
    }
}
