//! Host controller registers
//!
//! The ISP1760 family shares one register model, but the offsets differ
//! between the 32-bit ISP1760 / ISP1761 and the 16-bit ISP1763. The scheduler
//! names registers symbolically with [`Reg`], and a [`RegisterMap`] turns
//! those names into offsets.
//!
//! This module also re-exports the RAL macros that pack PTD fields.

pub use ral_registers::{read_reg, write_reg, RWRegister};

/// A host controller register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    /// Frame index, in microframes
    FrIndex,
    /// Root port status and control
    PortSc1,
    IsoDoneMap,
    IsoSkipMap,
    IsoLastPtd,
    IntDoneMap,
    IntSkipMap,
    IntLastPtd,
    AtlDoneMap,
    AtlSkipMap,
    AtlLastPtd,
    /// Enables processing of the PTD tables
    BufferStatus,
    /// Memory window and bank select
    Memory,
    /// Data port for indirect memory access
    Data,
    /// Pending interrupts; write ones to clear
    Interrupt,
    InterruptEnable,
    IntIrqMaskOr,
    AtlIrqMaskOr,
    IntIrqMaskAnd,
    AtlIrqMaskAnd,
}

impl Reg {
    /// Number of symbolic registers
    pub const COUNT: usize = Reg::AtlIrqMaskAnd as usize + 1;
}

/// Register offsets for one chip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterMap {
    offsets: [u32; Reg::COUNT],
}

impl RegisterMap {
    /// ISP1760 / ISP1761
    ///
    /// These chips have no data port; payload memory is mapped into the
    /// register window. The `Data` offset is unused.
    pub const ISP1760: Self = Self {
        offsets: [
            0x002c, // FrIndex
            0x0064, // PortSc1
            0x0130, // IsoDoneMap
            0x0134, // IsoSkipMap
            0x0138, // IsoLastPtd
            0x0140, // IntDoneMap
            0x0144, // IntSkipMap
            0x0148, // IntLastPtd
            0x0150, // AtlDoneMap
            0x0154, // AtlSkipMap
            0x0158, // AtlLastPtd
            0x0334, // BufferStatus
            0x033c, // Memory
            0x0000, // Data
            0x0310, // Interrupt
            0x0314, // InterruptEnable
            0x031c, // IntIrqMaskOr
            0x0320, // AtlIrqMaskOr
            0x0328, // IntIrqMaskAnd
            0x032c, // AtlIrqMaskAnd
        ],
    };

    /// ISP1763
    ///
    /// 16-bit registers, and payload memory behind a data port.
    pub const ISP1763: Self = Self {
        offsets: [
            0x0098, // FrIndex
            0x00a0, // PortSc1
            0x00a4, // IsoDoneMap
            0x00a6, // IsoSkipMap
            0x00a8, // IsoLastPtd
            0x00aa, // IntDoneMap
            0x00ac, // IntSkipMap
            0x00ae, // IntLastPtd
            0x00b0, // AtlDoneMap
            0x00b2, // AtlSkipMap
            0x00b4, // AtlLastPtd
            0x00ba, // BufferStatus
            0x00c4, // Memory
            0x00c6, // Data
            0x00d4, // Interrupt
            0x00d6, // InterruptEnable
            0x00da, // IntIrqMaskOr
            0x00dc, // AtlIrqMaskOr
            0x00e0, // IntIrqMaskAnd
            0x00e2, // AtlIrqMaskAnd
        ],
    };

    /// Returns the offset of `reg`
    pub const fn offset(&self, reg: Reg) -> u32 {
        self.offsets[reg as usize]
    }
}

bitflags::bitflags! {
    /// Interrupt status and enable bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        /// Start of transaction
        const SOT = 1 << 1;
        /// End of transaction
        const EOT = 1 << 3;
        /// An INT PTD completed
        const INT = 1 << 7;
        /// An ATL PTD completed
        const ATL = 1 << 8;
        /// An ISO PTD completed
        const ISO = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Which PTD tables the chip walks
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferStatus: u32 {
        const ATL_FILLED = 1 << 0;
        const INT_FILLED = 1 << 1;
        const ISO_FILLED = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Root port status and control
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CONNECT = 1 << 0;
        const CONNECT_CHANGE = 1 << 1;
        const ENABLE = 1 << 2;
        const ENABLE_CHANGE = 1 << 3;
        const OVER_CURRENT = 1 << 4;
        const OVER_CURRENT_CHANGE = 1 << 5;
        const RESUME = 1 << 6;
        const SUSPEND = 1 << 7;
        const RESET = 1 << 8;
        const LINE_STATUS = 0b11 << 10;
        const POWER = 1 << 12;
        const OWNER = 1 << 13;

        const _ = !0;
    }
}

impl PortSc {
    /// Returns the D+ / D- line state
    pub const fn line_status(self) -> u32 {
        (self.bits() & Self::LINE_STATUS.bits()) >> 10
    }
}
