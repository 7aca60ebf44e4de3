// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::MAX_SLOTS,
};
use ::arrayvec::ArrayVec;
use ::std::{
    fmt,
    sync::{
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Xclbin UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XclbinId([u8; 16]);

/// Bitstream loaded in one partition slot.
#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    xclbin_id: XclbinId,
    /// Contexts pinning the bitstream in place.
    refcnt: u32,
}

/// Partition slots and the xclbin loaded in each of them.
pub struct SlotTable {
    slots: Mutex<ArrayVec<Option<SlotEntry>, MAX_SLOTS>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl XclbinId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl SlotTable {
    pub fn new() -> Self {
        let mut slots: ArrayVec<Option<SlotEntry>, MAX_SLOTS> = ArrayVec::new();
        while !slots.is_full() {
            slots.push(None);
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, ArrayVec<Option<SlotEntry>, MAX_SLOTS>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the bitstream now programmed in `slot_idx`.
    pub fn load(&self, slot_idx: u32, xclbin_id: XclbinId) -> Result<(), Fail> {
        let mut slots = self.lock_table();
        let entry: &mut Option<SlotEntry> = Self::entry_mut(&mut slots, slot_idx, "load")?;
        match *entry {
            Some(loaded) if loaded.xclbin_id == xclbin_id => {
                debug!("load(): xclbin {} already in slot {}", xclbin_id, slot_idx);
                Ok(())
            },
            Some(loaded) if loaded.refcnt > 0 => {
                let cause: String = format!(
                    "slot {} is locked by xclbin {} ({} references)",
                    slot_idx, loaded.xclbin_id, loaded.refcnt
                );
                error!("load(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
            _ => {
                info!("load(): xclbin {} in slot {}", xclbin_id, slot_idx);
                *entry = Some(SlotEntry { xclbin_id, refcnt: 0 });
                Ok(())
            },
        }
    }

    /// Forgets the bitstream of an unlocked slot.
    pub fn unload(&self, slot_idx: u32) -> Result<(), Fail> {
        let mut slots = self.lock_table();
        let entry: &mut Option<SlotEntry> = Self::entry_mut(&mut slots, slot_idx, "unload")?;
        match *entry {
            Some(loaded) if loaded.refcnt > 0 => {
                let cause: String = format!("slot {} is locked ({} references)", slot_idx, loaded.refcnt);
                error!("unload(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
            _ => {
                *entry = None;
                Ok(())
            },
        }
    }

    pub fn xclbin(&self, slot_idx: u32) -> Option<XclbinId> {
        self.lock_table().get(slot_idx as usize)?.map(|entry| entry.xclbin_id)
    }

    /// Slot holding `xclbin_id`.
    pub fn slot_of(&self, xclbin_id: XclbinId) -> Option<u32> {
        self.lock_table()
            .iter()
            .position(|entry| matches!(entry, Some(e) if e.xclbin_id == xclbin_id))
            .map(|idx| idx as u32)
    }

    /// Pins the bitstream `xclbin_id` wherever it is loaded. Returns its slot.
    pub fn lock(&self, xclbin_id: XclbinId) -> Result<u32, Fail> {
        let mut slots = self.lock_table();
        for (idx, entry) in slots.iter_mut().enumerate() {
            if let Some(e) = entry.as_mut().filter(|e| e.xclbin_id == xclbin_id) {
                e.refcnt += 1;
                return Ok(idx as u32);
            }
        }
        let cause: String = format!("xclbin {} is not loaded", xclbin_id);
        error!("lock(): {}", cause);
        Err(Fail::new(libc::ENOENT, &cause))
    }

    /// Pins the bitstream of `slot_idx`, which must be `xclbin_id`.
    pub fn lock_slot(&self, slot_idx: u32, xclbin_id: XclbinId) -> Result<(), Fail> {
        let mut slots = self.lock_table();
        match Self::entry_mut(&mut slots, slot_idx, "lock_slot")? {
            Some(e) if e.xclbin_id == xclbin_id => {
                e.refcnt += 1;
                Ok(())
            },
            _ => {
                let cause: String = format!("xclbin {} is not loaded in slot {}", xclbin_id, slot_idx);
                error!("lock_slot(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Drops one pin on the bitstream of `slot_idx`, which must be `xclbin_id`.
    pub fn unlock(&self, slot_idx: u32, xclbin_id: XclbinId) -> Result<(), Fail> {
        let mut slots = self.lock_table();
        match Self::entry_mut(&mut slots, slot_idx, "unlock")? {
            Some(e) if e.xclbin_id == xclbin_id && e.refcnt > 0 => {
                e.refcnt -= 1;
                Ok(())
            },
            _ => {
                let cause: String = format!("xclbin {} is not locked in slot {}", xclbin_id, slot_idx);
                error!("unlock(): {}", cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Pins on the bitstream of a slot.
    pub fn refcnt(&self, slot_idx: u32) -> u32 {
        match self.lock_table().get(slot_idx as usize) {
            Some(Some(entry)) => entry.refcnt,
            _ => 0,
        }
    }

    fn entry_mut<'a>(
        slots: &'a mut ArrayVec<Option<SlotEntry>, MAX_SLOTS>,
        slot_idx: u32,
        caller: &str,
    ) -> Result<&'a mut Option<SlotEntry>, Fail> {
        match slots.get_mut(slot_idx as usize) {
            Some(entry) => Ok(entry),
            None => {
                let cause: String = format!("slot {} out of range", slot_idx);
                error!("{}(): {}", caller, cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl From<[u8; 16]> for XclbinId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for XclbinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b: &[u8; 16] = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for XclbinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XclbinId({})", self)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
