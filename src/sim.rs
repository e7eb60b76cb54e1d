//! A simulated host controller, for tests
//!
//! `SimChip` implements [`ChipAccess`] over a register file and 64 KiB of chip
//! memory. Tests play the part of the silicon: they inspect the PTDs that the
//! scheduler writes, then finish them with the helpers below.

extern crate std;

use crate::{
    access::ChipAccess,
    ptd::{Ptd, PTD_SIZE},
    ral::{Interrupts, PortSc, Reg},
    slots::Table,
};
use std::{vec, vec::Vec};

const MEMORY_SIZE: usize = 0x1_0000;

/// Something the scheduler did to the chip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    WriteReg(Reg, u32),
    WriteMem(u32, usize),
}

pub struct SimChip {
    regs: [u32; Reg::COUNT],
    memory: Vec<u8>,
    /// Every write, in order
    pub events: Vec<Event>,
    /// Enable the port when a reset finishes
    pub port_enables_after_reset: bool,
    /// Calls to `before_dispatch`
    pub dispatches: usize,
}

impl SimChip {
    pub fn new() -> Self {
        SimChip {
            regs: [0; Reg::COUNT],
            memory: vec![0; MEMORY_SIZE],
            events: Vec::new(),
            port_enables_after_reset: false,
            dispatches: 0,
        }
    }

    /// Read a register without side effects
    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs[reg as usize]
    }

    /// Write a register without side effects
    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.regs[reg as usize] = value;
    }

    pub fn mem(&self, addr: u32, len: usize) -> &[u8] {
        let addr = addr as usize;
        &self.memory[addr..addr + len]
    }

    pub fn ptd(&self, table: Table, slot: usize) -> Ptd {
        let mut bytes = [0; PTD_SIZE];
        bytes.copy_from_slice(self.mem(table.ptd_address(slot), PTD_SIZE));
        Ptd::from_bytes(&bytes)
    }

    pub fn set_ptd(&mut self, table: Table, slot: usize, ptd: &Ptd) {
        let addr = table.ptd_address(slot) as usize;
        self.memory[addr..addr + PTD_SIZE].copy_from_slice(&ptd.to_bytes());
    }

    /// Indicates if the chip would execute the slot's PTD
    pub fn is_armed(&self, table: Table, slot: usize) -> bool {
        self.reg(table.skip_map()) & (1 << slot) == 0 && self.ptd(table, slot).valid
    }

    /// Set the slot's done bit, and raise the interrupt
    pub fn raise_done(&mut self, table: Table, slot: usize) {
        self.regs[table.done_map() as usize] |= 1 << slot;
        let flag = match table {
            Table::Atl => Interrupts::ATL,
            Table::Int => Interrupts::INT,
        };
        self.regs[Reg::Interrupt as usize] |= flag.bits();
    }

    /// Update the slot's PTD the way silicon would after moving `transferred`
    /// bytes, without signaling completion
    pub fn finish_silently(&mut self, table: Table, slot: usize, transferred: usize) {
        assert!(self.is_armed(table, slot), "Slot {} isn't armed", slot);
        let mut ptd = self.ptd(table, slot);
        let max_packet = (ptd.max_packet as usize).max(1);
        let packets = transferred.div_ceil(max_packet).max(1);
        ptd.valid = false;
        ptd.active = false;
        ptd.transferred = transferred as u16;
        ptd.toggle ^= packets % 2 == 1;
        self.set_ptd(table, slot, &ptd);
    }

    /// Successfully finish the slot's PTD
    pub fn complete(&mut self, table: Table, slot: usize, transferred: usize) {
        self.finish_silently(table, slot, transferred);
        self.raise_done(table, slot);
    }

    /// The device answers an IN token with `data`
    pub fn complete_in(&mut self, table: Table, slot: usize, data: &[u8]) {
        let ptd = self.ptd(table, slot);
        let addr = ptd.payload_address() as usize;
        self.memory[addr..addr + data.len()].copy_from_slice(data);
        self.complete(table, slot, data.len());
    }

    /// The device NAKs until the NAK counter expires
    pub fn nak(&mut self, table: Table, slot: usize) {
        assert!(self.is_armed(table, slot), "Slot {} isn't armed", slot);
        let mut ptd = self.ptd(table, slot);
        ptd.valid = false;
        ptd.nak_count = 0;
        self.set_ptd(table, slot, &ptd);
        self.raise_done(table, slot);
    }

    /// A transaction error that the chip will retry
    pub fn transaction_error(&mut self, table: Table, slot: usize) {
        assert!(self.is_armed(table, slot), "Slot {} isn't armed", slot);
        let mut ptd = self.ptd(table, slot);
        ptd.valid = false;
        ptd.error = true;
        ptd.cerr = ptd.cerr.saturating_sub(1);
        ptd.nak_count = 1;
        self.set_ptd(table, slot, &ptd);
        self.raise_done(table, slot);
    }

    /// The chip halts the PTD; `f` adds the details
    pub fn halt(&mut self, table: Table, slot: usize, f: impl FnOnce(&mut Ptd)) {
        assert!(self.is_armed(table, slot), "Slot {} isn't armed", slot);
        let mut ptd = self.ptd(table, slot);
        ptd.valid = false;
        ptd.active = false;
        ptd.halt = true;
        f(&mut ptd);
        self.set_ptd(table, slot, &ptd);
        self.raise_done(table, slot);
    }

    fn write_portsc(&mut self, value: u32) {
        let change = PortSc::CONNECT_CHANGE | PortSc::ENABLE_CHANGE | PortSc::OVER_CURRENT_CHANGE;
        let old = PortSc::from_bits_retain(self.reg(Reg::PortSc1));
        let value = PortSc::from_bits_retain(value);
        let mut next = value.difference(change) | (old & change).difference(value);
        if old.contains(PortSc::RESET)
            && !next.contains(PortSc::RESET)
            && self.port_enables_after_reset
        {
            next |= PortSc::ENABLE;
        }
        self.set_reg(Reg::PortSc1, next.bits());
    }
}

impl ChipAccess for SimChip {
    fn read_reg(&mut self, reg: Reg) -> u32 {
        match reg {
            // Done maps clear on read
            Reg::AtlDoneMap | Reg::IntDoneMap | Reg::IsoDoneMap => {
                core::mem::take(&mut self.regs[reg as usize])
            }
            _ => self.regs[reg as usize],
        }
    }

    fn write_reg(&mut self, reg: Reg, value: u32) {
        self.events.push(Event::WriteReg(reg, value));
        match reg {
            Reg::Interrupt => self.regs[reg as usize] &= !value,
            Reg::PortSc1 => self.write_portsc(value),
            _ => self.regs[reg as usize] = value,
        }
    }

    fn read_mem(&mut self, addr: u32, dst: &mut [u8]) {
        dst.copy_from_slice(self.mem(addr, dst.len()));
    }

    fn write_mem(&mut self, addr: u32, src: &[u8]) {
        self.events.push(Event::WriteMem(addr, src.len()));
        let addr = addr as usize;
        self.memory[addr..addr + src.len()].copy_from_slice(src);
    }

    fn before_dispatch(&mut self) {
        self.dispatches += 1;
    }
}
