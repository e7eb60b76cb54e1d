//! PTD slot tables
//!
//! The chip has one table of PTD slots for asynchronous transfers (ATL), and
//! one for interrupt transfers (INT). A slot is either free, or holds the PTD
//! for exactly one started QTD.

use crate::{
    ptd::{ATL_PTD_OFFSET, INT_PTD_OFFSET, PTD_SIZE},
    ral::Reg,
};

/// Upper bound on slots per table
pub const MAX_SLOTS: usize = 32;

/// A PTD table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    /// Control and bulk
    Atl,
    /// Interrupt
    Int,
}

impl Table {
    /// Chip address of the slot's PTD
    pub const fn ptd_address(self, slot: usize) -> u32 {
        let base = match self {
            Table::Atl => ATL_PTD_OFFSET,
            Table::Int => INT_PTD_OFFSET,
        };
        base + (slot * PTD_SIZE) as u32
    }

    pub const fn skip_map(self) -> Reg {
        match self {
            Table::Atl => Reg::AtlSkipMap,
            Table::Int => Reg::IntSkipMap,
        }
    }

    pub const fn done_map(self) -> Reg {
        match self {
            Table::Atl => Reg::AtlDoneMap,
            Table::Int => Reg::IntDoneMap,
        }
    }

    pub const fn last_ptd(self) -> Reg {
        match self {
            Table::Atl => Reg::AtlLastPtd,
            Table::Int => Reg::IntLastPtd,
        }
    }
}

/// Who owns an occupied slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Queue head index
    pub qh: usize,
    /// QTD index
    pub qtd: usize,
    /// When a periodic check first saw this slot occupied, in milliseconds
    pub seen: Option<u32>,
}

/// Slots the hardware reported as done, but that we haven't handled
///
/// Reading a done map clears it in hardware, so every read must land here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoneSet(u32);

impl DoneSet {
    /// Add the bits from a done map read
    pub fn absorb(&mut self, bits: u32) {
        self.0 |= bits;
    }

    /// Drop a single slot
    pub fn forget(&mut self, slot: usize) {
        self.0 &= !(1 << slot);
    }

    /// Keep only the slots in `mask`
    pub fn retain(&mut self, mask: u32) {
        self.0 &= mask;
    }

    /// Take the lowest pending slot
    pub fn pop(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let slot = self.0.trailing_zeros() as usize;
        self.forget(slot);
        Some(slot)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Software mirror of a PTD table
pub struct SlotTable {
    slots: [Option<Slot>; MAX_SLOTS],
    count: usize,
    /// Done bits that still need handling
    pub done: DoneSet,
}

impl SlotTable {
    /// A table with `count` usable slots, all free
    pub fn new(count: usize) -> Self {
        SlotTable {
            slots: [None; MAX_SLOTS],
            count: count.min(MAX_SLOTS),
            done: DoneSet::default(),
        }
    }

    /// Returns the lowest free slot
    pub fn first_free(&self) -> Option<usize> {
        self.slots[..self.count].iter().position(Option::is_none)
    }

    pub fn get(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Record that `slot` now holds a PTD
    pub fn occupy(&mut self, slot: usize, owner: Slot) {
        debug_assert!(slot < self.count);
        debug_assert!(self.slots[slot].is_none(), "Slot is already in use");
        self.slots[slot] = Some(owner);
    }

    /// Free `slot`, returning its owner
    pub fn release(&mut self, slot: usize) -> Option<Slot> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Record `now_ms` on occupied slots that haven't been seen yet
    pub fn mark_seen(&mut self, now_ms: u32) {
        for owner in self.slots[..self.count].iter_mut().flatten() {
            owner.seen.get_or_insert(now_ms);
        }
    }

    /// Iterate over occupied slots
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots[..self.count]
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|slot| (idx, slot)))
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.occupied().count()
    }

    /// Free every slot, and drop pending done bits
    pub fn clear(&mut self) {
        self.slots = [None; MAX_SLOTS];
        self.done = DoneSet::default();
    }
}
