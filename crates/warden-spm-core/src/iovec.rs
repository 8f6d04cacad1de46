//! Per-vector access tracking
//!
//! Each call message carries up to four input and four output vectors. A
//! vector is consumed either by copy (read/skip/write, cursor-based) or by
//! mapping (the whole buffer is handed to the service until unmapped). The
//! two modes are exclusive per slot and mapping is one-shot: once a slot is
//! unmapped it is retired for the rest of the message's life. The tracker
//! enforces those rules; every violation surfaces as a caller protocol
//! error.

use alloc::vec;
use alloc::vec::Vec;
use warden_ipc::{IOVEC_SLOTS, MAX_IOVEC};

use crate::types::SpmMessage;

/// Access state of one vector slot. Input vectors occupy slots 0..4,
/// output vectors slots 4..8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Never touched.
    #[default]
    Unused,
    /// Touched by a copy operation; mapping is no longer allowed.
    CopyAccessed,
    /// Mapped to the service; copy operations are refused.
    Mapped,
    /// Unmapped after mapping; permanently retired.
    Unmapped,
}

/// Vector access violations. All of them are protocol errors charged to the
/// serving partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IovecError {
    /// Vector index outside 0..4.
    OutOfRange,
    /// Vector operation on a connect or disconnect message.
    NotACall,
    /// Copy operation on a mapped slot, or mapping a copy-accessed slot.
    MixedAccess,
    /// Mapping a slot that is already mapped.
    AlreadyMapped,
    /// Unmapping a slot that is not mapped.
    NotMapped,
    /// Operation on a slot retired by a previous unmap.
    Retired,
    /// Mapping a zero-length vector.
    ZeroLength,
    /// Write or commit past the declared capacity.
    CapacityExceeded,
}

/// Per-message slot state table.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VecAccess {
    slots: [SlotState; IOVEC_SLOTS],
}

impl VecAccess {
    /// Fresh table with all slots unused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a slot.
    pub fn slot(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    /// Check that a copy operation is allowed on `slot`.
    fn check_copy(&self, slot: usize) -> Result<(), IovecError> {
        match self.slots[slot] {
            SlotState::Unused | SlotState::CopyAccessed => Ok(()),
            SlotState::Mapped => Err(IovecError::MixedAccess),
            SlotState::Unmapped => Err(IovecError::Retired),
        }
    }

    /// Record a completed copy operation on `slot`.
    fn note_copy(&mut self, slot: usize) {
        self.slots[slot] = SlotState::CopyAccessed;
    }

    /// Check that `slot` can be mapped.
    fn check_map(&self, slot: usize) -> Result<(), IovecError> {
        match self.slots[slot] {
            SlotState::Unused => Ok(()),
            SlotState::CopyAccessed => Err(IovecError::MixedAccess),
            SlotState::Mapped => Err(IovecError::AlreadyMapped),
            SlotState::Unmapped => Err(IovecError::Retired),
        }
    }

    /// Record a completed map on `slot`.
    fn note_mapped(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Mapped;
    }

    /// Check that `slot` can be unmapped.
    fn check_unmap(&self, slot: usize) -> Result<(), IovecError> {
        match self.slots[slot] {
            SlotState::Mapped => Ok(()),
            SlotState::Unmapped => Err(IovecError::Retired),
            _ => Err(IovecError::NotMapped),
        }
    }

    /// Record a completed unmap on `slot`. The slot is retired.
    fn note_unmapped(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Unmapped;
    }
}

/// An input vector: bytes supplied by the client, consumed by the service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InVec {
    data: Vec<u8>,
    total: usize,
    consumed: usize,
}

impl InVec {
    /// Wrap client-supplied bytes.
    pub fn new(data: Vec<u8>) -> Self {
        let total = data.len();
        Self {
            data,
            total,
            consumed: 0,
        }
    }

    /// Declared size, stable even after the buffer is mapped away.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes not yet consumed by read or skip.
    pub fn remaining(&self) -> usize {
        self.total - self.consumed
    }
}

/// An output vector: capacity declared by the client, filled by the service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutVec {
    capacity: usize,
    data: Vec<u8>,
}

impl OutVec {
    /// Declare an empty vector of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: Vec::new(),
        }
    }

    /// Declared capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes committed so far. Mapped slots report zero until unmapped.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Committed content, handed back to the client at reply time.
    pub fn take(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.data)
    }
}

impl SpmMessage {
    fn check_call_vector(&self, idx: usize) -> Result<(), IovecError> {
        if !self.kind.is_call() {
            return Err(IovecError::NotACall);
        }
        if idx >= MAX_IOVEC {
            return Err(IovecError::OutOfRange);
        }
        Ok(())
    }

    /// Copy up to `max` bytes from input vector `idx`, advancing its cursor.
    pub fn read_invec(&mut self, idx: usize, max: usize) -> Result<Vec<u8>, IovecError> {
        self.check_call_vector(idx)?;
        self.access.check_copy(idx)?;
        let iv = &mut self.invecs[idx];
        let n = core::cmp::min(max, iv.remaining());
        let out = iv.data[iv.consumed..iv.consumed + n].to_vec();
        iv.consumed += n;
        self.access.note_copy(idx);
        Ok(out)
    }

    /// Advance input vector `idx` by up to `num_bytes` without copying.
    /// Returns the number of bytes actually skipped.
    pub fn skip_invec(&mut self, idx: usize, num_bytes: usize) -> Result<usize, IovecError> {
        self.check_call_vector(idx)?;
        self.access.check_copy(idx)?;
        let iv = &mut self.invecs[idx];
        let n = core::cmp::min(num_bytes, iv.remaining());
        iv.consumed += n;
        self.access.note_copy(idx);
        Ok(n)
    }

    /// Append bytes to output vector `idx`. Fails without partial commit if
    /// the declared capacity would be exceeded.
    pub fn write_outvec(&mut self, idx: usize, data: &[u8]) -> Result<(), IovecError> {
        self.check_call_vector(idx)?;
        let slot = MAX_IOVEC + idx;
        self.access.check_copy(slot)?;
        let ov = &mut self.outvecs[idx];
        if ov.data.len() + data.len() > ov.capacity {
            return Err(IovecError::CapacityExceeded);
        }
        ov.data.extend_from_slice(data);
        self.access.note_copy(slot);
        Ok(())
    }

    /// Map input vector `idx`, transferring its remaining bytes to the
    /// caller wholesale.
    pub fn map_invec(&mut self, idx: usize) -> Result<Vec<u8>, IovecError> {
        self.check_call_vector(idx)?;
        self.access.check_map(idx)?;
        let iv = &mut self.invecs[idx];
        if iv.total == 0 {
            return Err(IovecError::ZeroLength);
        }
        self.access.note_mapped(idx);
        Ok(core::mem::take(&mut self.invecs[idx].data))
    }

    /// Unmap input vector `idx`, retiring the slot.
    pub fn unmap_invec(&mut self, idx: usize) -> Result<(), IovecError> {
        self.check_call_vector(idx)?;
        self.access.check_unmap(idx)?;
        self.access.note_unmapped(idx);
        Ok(())
    }

    /// Map output vector `idx`, handing out a zeroed buffer of its full
    /// capacity.
    pub fn map_outvec(&mut self, idx: usize) -> Result<Vec<u8>, IovecError> {
        self.check_call_vector(idx)?;
        let slot = MAX_IOVEC + idx;
        self.access.check_map(slot)?;
        let ov = &self.outvecs[idx];
        if ov.capacity == 0 {
            return Err(IovecError::ZeroLength);
        }
        self.access.note_mapped(slot);
        Ok(vec![0u8; self.outvecs[idx].capacity])
    }

    /// Unmap output vector `idx`, committing the first `len` bytes of the
    /// returned buffer. The slot is retired.
    pub fn unmap_outvec(&mut self, idx: usize, len: usize, mut buf: Vec<u8>) -> Result<(), IovecError> {
        self.check_call_vector(idx)?;
        let slot = MAX_IOVEC + idx;
        self.access.check_unmap(slot)?;
        let ov = &mut self.outvecs[idx];
        if len > ov.capacity || len > buf.len() {
            return Err(IovecError::CapacityExceeded);
        }
        buf.truncate(len);
        ov.data = buf;
        self.access.note_unmapped(slot);
        Ok(())
    }
}
