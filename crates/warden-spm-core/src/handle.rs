//! Handle registry
//!
//! Opaque handles are the only names clients and services hold for manager
//! objects. A handle packs a slot index and a generation counter; the
//! generation is bumped when a slot is released, so a stale handle held
//! across recycling fails validation instead of aliasing the new occupant.
//! Every lookup also checks the recorded owner, so a handle leaked to
//! another caller is as invalid as a forged one.

use alloc::vec::Vec;
use warden_ipc::{Handle, MAX_HANDLES};

use crate::types::{ClientId, ConnectionId, MessageId};

/// What a live registry slot refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleTarget {
    /// A client's connection to a service.
    Connection(ConnectionId),
    /// A message delivered to a serving partition.
    Message(MessageId),
}

/// A live registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleEntry {
    /// The caller this handle was issued to.
    pub owner: ClientId,
    /// The object the handle names.
    pub target: HandleTarget,
}

/// Registry failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleError {
    /// Null, stateless, stale, foreign, or never-issued handle.
    Invalid,
    /// All slots are in use.
    Exhausted,
}

#[derive(Debug, PartialEq)]
struct Slot {
    generation: u16,
    entry: Option<HandleEntry>,
}

/// Fixed-capacity arena of generation-checked handles.
#[derive(Debug, PartialEq)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u8>,
}

impl HandleTable {
    /// Create an empty table. Slots are materialized on demand.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Issue a handle for `target` to `owner`.
    pub fn allocate(&mut self, owner: ClientId, target: HandleTarget) -> Result<Handle, HandleError> {
        let entry = HandleEntry { owner, target };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Ok(Handle::from_parts(index, slot.generation));
        }
        if self.slots.len() >= MAX_HANDLES {
            return Err(HandleError::Exhausted);
        }
        let index = self.slots.len() as u8;
        // Generations start at 1 so a live handle is never the null handle.
        self.slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        Ok(Handle::from_parts(index, 1))
    }

    /// Validate a handle and return its entry. The caller must match the
    /// recorded owner.
    pub fn resolve(&self, handle: Handle, owner: ClientId) -> Result<&HandleEntry, HandleError> {
        if handle.is_null() || handle.is_stateless() {
            return Err(HandleError::Invalid);
        }
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(HandleError::Invalid)?;
        match &slot.entry {
            Some(entry) if slot.generation == handle.generation() && entry.owner == owner => {
                Ok(entry)
            }
            _ => Err(HandleError::Invalid),
        }
    }

    /// Validate a handle, retire it, and return the entry it held. The slot
    /// becomes reusable under a new generation.
    pub fn release(&mut self, handle: Handle, owner: ClientId) -> Result<HandleEntry, HandleError> {
        self.resolve(handle, owner)?;
        let index = handle.index();
        let slot = &mut self.slots[index as usize];
        let entry = slot.entry.take().ok_or(HandleError::Invalid)?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(index);
        Ok(entry)
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Iterate over live handles and their entries.
    pub fn iter_live(&self) -> impl Iterator<Item = (Handle, &HandleEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (Handle::from_parts(i as u8, slot.generation), entry))
        })
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
