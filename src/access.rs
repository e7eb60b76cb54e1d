//! Chip register and memory access
//!
//! The scheduler talks to the chip through [`ChipAccess`]. Two adapters are
//! provided, one for each way the ISP176x family exposes payload memory:
//!
//! - [`BankedWindow`] for chips that map memory into the register window
//!   (ISP1760, ISP1761). A read selects a bank and start address, then
//!   streams words.
//! - [`DataPort`] for chips that move memory through a data register
//!   (ISP1763).
//!
//! Both sit on top of an [`Mmio`], the raw register space. [`MmioBlock`]
//! is the volatile implementation for real hardware.

use crate::ral::{Reg, RegisterMap, RWRegister};

/// What the scheduler needs from the chip
pub trait ChipAccess {
    /// Read a register
    fn read_reg(&mut self, reg: Reg) -> u32;
    /// Write a register
    fn write_reg(&mut self, reg: Reg, value: u32);
    /// Copy chip memory at `addr` into `dst`
    fn read_mem(&mut self, addr: u32, dst: &mut [u8]);
    /// Copy `src` into chip memory at `addr`
    fn write_mem(&mut self, addr: u32, src: &[u8]);
    /// Called right before a PTD is placed into a slot
    fn before_dispatch(&mut self) {}
    /// Called right after a slot is forced into the skip map
    fn after_skip(&mut self) {}
}

/// Raw register space
pub trait Mmio {
    /// Read the 32-bit register at `offset`, in bytes
    fn read(&mut self, offset: u32) -> u32;
    /// Write the 32-bit register at `offset`, in bytes
    fn write(&mut self, offset: u32, value: u32);
    /// Spin for at least `ns` nanoseconds
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Settle time after changing the memory window, or the skip map
const SETTLE_NS: u32 = 100;

fn word_from(chunk: &[u8]) -> u32 {
    let mut word = [0; 4];
    word[..chunk.len()].copy_from_slice(chunk);
    u32::from_le_bytes(word)
}

/// Volatile access to the chip's register block
pub struct MmioBlock {
    base: *const RWRegister<u32>,
    cycles_per_us: u32,
}

impl MmioBlock {
    /// Access the register block owned by `peripherals`
    ///
    /// `cycles_per_us` is the core clock, in MHz. It sizes the busy waits.
    pub fn new<P: crate::Peripherals>(peripherals: &P, cycles_per_us: u32) -> Self {
        MmioBlock {
            base: peripherals.host_controller().cast(),
            cycles_per_us,
        }
    }

    fn register(&self, offset: u32) -> &RWRegister<u32> {
        // Safety: the Peripherals implementation guarantees that `base` points
        // to the chip's register block, which covers every offset in a
        // RegisterMap, and that we're the only user.
        unsafe { &*self.base.add(offset as usize / 4) }
    }
}

// Safety: MmioBlock is the only handle to the register block, so moving it
// between execution contexts can't create aliased access.
unsafe impl Send for MmioBlock {}

impl Mmio for MmioBlock {
    fn read(&mut self, offset: u32) -> u32 {
        self.register(offset).read()
    }
    fn write(&mut self, offset: u32, value: u32) {
        self.register(offset).write(value)
    }
    fn delay_ns(&mut self, ns: u32) {
        let cycles = (ns * self.cycles_per_us).div_ceil(1000);
        cortex_m::asm::delay(cycles.max(1));
    }
}

/// Memory mapped into the register window, behind a bank select
pub struct BankedWindow<M> {
    mmio: M,
    map: RegisterMap,
}

/// Bank select field of the memory register
const BANK_SHIFT: u32 = 16;

impl<M: Mmio> BankedWindow<M> {
    pub fn new(mmio: M, map: RegisterMap) -> Self {
        BankedWindow { mmio, map }
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    pub fn release(self) -> M {
        self.mmio
    }
}

impl<M: Mmio> ChipAccess for BankedWindow<M> {
    fn read_reg(&mut self, reg: Reg) -> u32 {
        self.mmio.read(self.map.offset(reg))
    }
    fn write_reg(&mut self, reg: Reg, value: u32) {
        self.mmio.write(self.map.offset(reg), value)
    }
    fn read_mem(&mut self, addr: u32, dst: &mut [u8]) {
        let bank = 0;
        self.mmio
            .write(self.map.offset(Reg::Memory), bank << BANK_SHIFT | addr);
        self.mmio.delay_ns(SETTLE_NS);

        for (idx, chunk) in dst.chunks_mut(4).enumerate() {
            let word = self.mmio.read(addr + 4 * idx as u32).to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
    }
    fn write_mem(&mut self, addr: u32, src: &[u8]) {
        for (idx, chunk) in src.chunks(4).enumerate() {
            self.mmio.write(addr + 4 * idx as u32, word_from(chunk));
        }
    }
    fn after_skip(&mut self) {
        self.mmio.delay_ns(SETTLE_NS);
    }
}

/// Memory behind an auto-incrementing data register
pub struct DataPort<M> {
    mmio: M,
    map: RegisterMap,
}

impl<M: Mmio> DataPort<M> {
    pub fn new(mmio: M, map: RegisterMap) -> Self {
        DataPort { mmio, map }
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    pub fn release(self) -> M {
        self.mmio
    }
}

impl<M: Mmio> ChipAccess for DataPort<M> {
    fn read_reg(&mut self, reg: Reg) -> u32 {
        self.mmio.read(self.map.offset(reg))
    }
    fn write_reg(&mut self, reg: Reg, value: u32) {
        self.mmio.write(self.map.offset(reg), value)
    }
    fn read_mem(&mut self, addr: u32, dst: &mut [u8]) {
        self.mmio.write(self.map.offset(Reg::Memory), addr);
        let data = self.map.offset(Reg::Data);
        for chunk in dst.chunks_mut(4) {
            let word = self.mmio.read(data).to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
    }
    fn write_mem(&mut self, addr: u32, src: &[u8]) {
        self.mmio.write(self.map.offset(Reg::Memory), addr);
        let data = self.map.offset(Reg::Data);
        for chunk in src.chunks(4) {
            self.mmio.write(data, word_from(chunk));
        }
    }
    fn before_dispatch(&mut self) {
        // The data port needs time to drain before the PTD lands.
        self.mmio.delay_ns(SETTLE_NS);
    }
    fn after_skip(&mut self) {
        self.mmio.delay_ns(SETTLE_NS);
    }
}

#[cfg(test)]
mod test {
    extern crate std;
    use std::vec::Vec;

    use super::{BankedWindow, ChipAccess, DataPort, Mmio};
    use crate::ral::{Reg, RegisterMap};

    /// Records every access, and serves reads from a word array
    #[derive(Default)]
    struct Recorder {
        words: Vec<(u32, u32)>,
        writes: Vec<(u32, u32)>,
        reads: Vec<u32>,
        delays: u32,
    }

    impl Mmio for Recorder {
        fn read(&mut self, offset: u32) -> u32 {
            self.reads.push(offset);
            self.words
                .iter()
                .find(|(addr, _)| *addr == offset)
                .map(|(_, value)| *value)
                .unwrap_or(0)
        }
        fn write(&mut self, offset: u32, value: u32) {
            self.writes.push((offset, value));
        }
        fn delay_ns(&mut self, _: u32) {
            self.delays += 1;
        }
    }

    #[test]
    fn banked_window_reads() {
        let mut recorder = Recorder::default();
        recorder.words.push((0x1000, 0x04030201));
        recorder.words.push((0x1004, 0x08070605));
        let mut chip = BankedWindow::new(recorder, RegisterMap::ISP1760);

        let mut dst = [0u8; 6];
        chip.read_mem(0x1000, &mut dst);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6]);

        let recorder = chip.release();
        assert_eq!(recorder.writes, [(0x33c, 0x1000)]);
        assert_eq!(recorder.reads, [0x1000, 0x1004]);
        assert_eq!(recorder.delays, 1);
    }

    #[test]
    fn banked_window_writes() {
        let mut chip = BankedWindow::new(Recorder::default(), RegisterMap::ISP1760);
        chip.write_mem(0x0c00, &[1, 2, 3, 4, 5]);
        chip.write_reg(Reg::AtlSkipMap, 0xffff_fffe);
        let recorder = chip.release();
        assert_eq!(
            recorder.writes,
            [(0x0c00, 0x04030201), (0x0c04, 0x05), (0x154, 0xffff_fffe)]
        );
    }

    #[test]
    fn data_port() {
        let mut recorder = Recorder::default();
        recorder.words.push((0xc6, 0xddccbbaa));
        let mut chip = DataPort::new(recorder, RegisterMap::ISP1763);

        chip.write_mem(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut dst = [0u8; 3];
        chip.read_mem(0x1000, &mut dst);
        assert_eq!(dst, [0xaa, 0xbb, 0xcc]);

        chip.before_dispatch();
        let recorder = chip.release();
        assert_eq!(
            recorder.writes,
            [
                (0xc4, 0x1000),
                (0xc6, 0x04030201),
                (0xc6, 0x08070605),
                (0xc4, 0x1000)
            ]
        );
        assert_eq!(recorder.reads, [0xc6]);
        assert_eq!(recorder.delays, 1);
    }
}
