//! Proprietary transfer descriptors (PTD)
//!
//! A PTD is the chip's view of one transaction: eight 32-bit words in a slot of
//! the ATL or INT table. [`Ptd`] is a plain value with named fields. It's
//! encoded into, and decoded from, an in-memory word image that implements a
//! RAL-compatible interface, so fields are packed the same way as registers.
//!
//! This module also builds PTDs from QTDs, and classifies completed PTDs.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{
    qtd::{PacketType, Qtd},
    ral,
    urb::{Pipe, Speed},
    Error,
};
use core::cell::Cell;
use usb_device::endpoint::EndpointType;

/// Size of one PTD, in bytes
pub const PTD_SIZE: usize = 32;
/// Chip address of the isochronous PTD table
pub const ISO_PTD_OFFSET: u32 = 0x0400;
/// Chip address of the interrupt PTD table
pub const INT_PTD_OFFSET: u32 = 0x0800;
/// Chip address of the asynchronous (control and bulk) PTD table
pub const ATL_PTD_OFFSET: u32 = 0x0c00;

/// PTDs address payload memory in 8 byte units, relative to the start
/// of the PTD area.
const fn base_to_chip(addr: u32) -> u32 {
    (addr - ISO_PTD_OFFSET) >> 3
}

/// Number of transaction errors the hardware tolerates before it halts
pub const ERR_COUNTER: u8 = 3;

/// Retry counters written into every PTD
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryCounters {
    /// NAK reload value
    pub reload: u8,
    /// Initial NAK counter
    pub nak: u8,
    /// Transaction error counter
    pub cerr: u8,
}

impl RetryCounters {
    /// Retry NAKs in software, after every NAK.
    ///
    /// The chip's NAK reload misbehaves on some silicon revisions, so this is
    /// the default.
    pub const SOFTWARE_NAK: Self = Self {
        reload: 0,
        nak: 0,
        cerr: ERR_COUNTER,
    };
}

impl Default for RetryCounters {
    fn default() -> Self {
        Self::SOFTWARE_NAK
    }
}

/// Transfer type, as encoded in the PTD
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferType {
    #[default]
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(TransferType::Control),
            2 => Some(TransferType::Bulk),
            3 => Some(TransferType::Interrupt),
            _ => None,
        }
    }

    fn of(kind: EndpointType) -> Self {
        match kind {
            EndpointType::Bulk => TransferType::Bulk,
            EndpointType::Interrupt => TransferType::Interrupt,
            _ => TransferType::Control,
        }
    }
}

/// Speed encoding for a low speed split transaction
const SE_LOW_SPEED: u32 = 2;

/// Per-microframe status codes in DW4
const INT_UNDERRUN: u32 = 1 << 2;
const INT_BABBLE: u32 = 1 << 1;
const INT_EXACT: u32 = 1 << 0;

/// A PTD, decoded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ptd {
    // DW0
    pub valid: bool,
    pub length: u16,
    pub max_packet: u16,
    pub multi: u8,
    pub endpoint: u8,
    // DW1
    pub device_address: u8,
    pub token: PacketType,
    pub transfer_type: TransferType,
    pub split: bool,
    pub low_speed: bool,
    pub port: u8,
    pub hub: u8,
    // DW2
    pub period: u8,
    pub start_address: u16,
    pub reload: u8,
    // DW3
    pub transferred: u16,
    pub nak_count: u8,
    pub cerr: u8,
    pub toggle: bool,
    pub ping: bool,
    pub error: bool,
    pub babble: bool,
    pub halt: bool,
    pub active: bool,
    // DW4
    pub microframes: u8,
    pub microframe_status: u32,
    // DW5
    pub complete_split: u8,
}

/// One word of a PTD image
struct Word(Cell<u32>);

impl Word {
    const fn new(value: u32) -> Self {
        Word(Cell::new(value))
    }
    fn read(&self) -> u32 {
        self.0.get()
    }
    fn write(&self, value: u32) {
        self.0.set(value)
    }
}

/// A PTD image, in chip word order
struct Words {
    DW0: Word,
    DW1: Word,
    DW2: Word,
    DW3: Word,
    DW4: Word,
    DW5: Word,
    DW6: Word,
    DW7: Word,
}

impl Words {
    const fn new(words: [u32; 8]) -> Self {
        Words {
            DW0: Word::new(words[0]),
            DW1: Word::new(words[1]),
            DW2: Word::new(words[2]),
            DW3: Word::new(words[3]),
            DW4: Word::new(words[4]),
            DW5: Word::new(words[5]),
            DW6: Word::new(words[6]),
            DW7: Word::new(words[7]),
        }
    }

    fn into_array(self) -> [u32; 8] {
        [
            self.DW0.read(),
            self.DW1.read(),
            self.DW2.read(),
            self.DW3.read(),
            self.DW4.read(),
            self.DW5.read(),
            self.DW6.read(),
            self.DW7.read(),
        ]
    }
}

macro_rules! field {
    ($name:ident, $offset:expr, $width:expr) => {
        pub mod $name {
            pub const offset: u32 = $offset;
            pub const mask: u32 = ((1 << $width) - 1) << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    };
}

mod DW0 {
    field!(VALID, 0, 1);
    field!(LENGTH, 3, 15);
    field!(MAX_PACKET, 18, 11);
    field!(MULTI, 29, 2);
    field!(ENDPOINT_LOW, 31, 1);
}

mod DW1 {
    field!(ENDPOINT_HIGH, 0, 3);
    field!(DEVICE_ADDRESS, 3, 7);
    field!(TOKEN, 10, 2);
    field!(TRANSFER_TYPE, 12, 2);
    field!(SPLIT, 14, 1);
    field!(SPEED, 16, 2);
    field!(PORT, 18, 7);
    field!(HUB, 25, 7);
}

mod DW2 {
    field!(PERIOD, 0, 8);
    field!(START_ADDRESS, 8, 16);
    field!(RELOAD, 25, 4);
}

mod DW3 {
    field!(TRANSFERRED, 0, 15);
    field!(NAK_COUNT, 19, 4);
    field!(CERR, 23, 2);
    field!(TOGGLE, 25, 1);
    field!(PING, 26, 1);
    field!(ERROR, 28, 1);
    field!(BABBLE, 29, 1);
    field!(HALT, 30, 1);
    field!(ACTIVE, 31, 1);
}

mod DW4 {
    field!(MICROFRAMES, 0, 8);
    field!(STATUS, 8, 24);
}

mod DW5 {
    field!(COMPLETE_SPLIT, 0, 8);
}

impl Ptd {
    /// Encode the PTD into its eight chip words
    pub fn to_words(&self) -> [u32; 8] {
        let words = Words::new([0; 8]);
        ral::write_reg!(
            crate::ptd,
            &words,
            DW0,
            VALID: self.valid as u32,
            LENGTH: self.length as u32,
            MAX_PACKET: self.max_packet as u32,
            MULTI: self.multi as u32,
            ENDPOINT_LOW: self.endpoint as u32 & 1
        );
        ral::write_reg!(
            crate::ptd,
            &words,
            DW1,
            ENDPOINT_HIGH: self.endpoint as u32 >> 1,
            DEVICE_ADDRESS: self.device_address as u32,
            TOKEN: self.token as u32,
            TRANSFER_TYPE: self.transfer_type as u32,
            SPLIT: self.split as u32,
            SPEED: if self.low_speed { SE_LOW_SPEED } else { 0 },
            PORT: self.port as u32,
            HUB: self.hub as u32
        );
        ral::write_reg!(
            crate::ptd,
            &words,
            DW2,
            PERIOD: self.period as u32,
            START_ADDRESS: self.start_address as u32,
            RELOAD: self.reload as u32
        );
        ral::write_reg!(
            crate::ptd,
            &words,
            DW3,
            TRANSFERRED: self.transferred as u32,
            NAK_COUNT: self.nak_count as u32,
            CERR: self.cerr as u32,
            TOGGLE: self.toggle as u32,
            PING: self.ping as u32,
            ERROR: self.error as u32,
            BABBLE: self.babble as u32,
            HALT: self.halt as u32,
            ACTIVE: self.active as u32
        );
        ral::write_reg!(
            crate::ptd,
            &words,
            DW4,
            MICROFRAMES: self.microframes as u32,
            STATUS: self.microframe_status
        );
        ral::write_reg!(crate::ptd, &words, DW5, COMPLETE_SPLIT: self.complete_split as u32);
        words.into_array()
    }

    /// Decode a PTD from its eight chip words
    ///
    /// Reserved bits are dropped.
    pub fn from_words(words: [u32; 8]) -> Self {
        let w = Words::new(words);
        let token = ral::read_reg!(crate::ptd, &w, DW1, TOKEN);
        let transfer_type = ral::read_reg!(crate::ptd, &w, DW1, TRANSFER_TYPE);
        Ptd {
            valid: ral::read_reg!(crate::ptd, &w, DW0, VALID == 1),
            length: ral::read_reg!(crate::ptd, &w, DW0, LENGTH) as u16,
            max_packet: ral::read_reg!(crate::ptd, &w, DW0, MAX_PACKET) as u16,
            multi: ral::read_reg!(crate::ptd, &w, DW0, MULTI) as u8,
            endpoint: (ral::read_reg!(crate::ptd, &w, DW0, ENDPOINT_LOW)
                | ral::read_reg!(crate::ptd, &w, DW1, ENDPOINT_HIGH) << 1) as u8,
            device_address: ral::read_reg!(crate::ptd, &w, DW1, DEVICE_ADDRESS) as u8,
            token: PacketType::from_bits(token).unwrap_or_default(),
            transfer_type: TransferType::from_bits(transfer_type).unwrap_or_default(),
            split: ral::read_reg!(crate::ptd, &w, DW1, SPLIT == 1),
            low_speed: ral::read_reg!(crate::ptd, &w, DW1, SPEED) == SE_LOW_SPEED,
            port: ral::read_reg!(crate::ptd, &w, DW1, PORT) as u8,
            hub: ral::read_reg!(crate::ptd, &w, DW1, HUB) as u8,
            period: ral::read_reg!(crate::ptd, &w, DW2, PERIOD) as u8,
            start_address: ral::read_reg!(crate::ptd, &w, DW2, START_ADDRESS) as u16,
            reload: ral::read_reg!(crate::ptd, &w, DW2, RELOAD) as u8,
            transferred: ral::read_reg!(crate::ptd, &w, DW3, TRANSFERRED) as u16,
            nak_count: ral::read_reg!(crate::ptd, &w, DW3, NAK_COUNT) as u8,
            cerr: ral::read_reg!(crate::ptd, &w, DW3, CERR) as u8,
            toggle: ral::read_reg!(crate::ptd, &w, DW3, TOGGLE == 1),
            ping: ral::read_reg!(crate::ptd, &w, DW3, PING == 1),
            error: ral::read_reg!(crate::ptd, &w, DW3, ERROR == 1),
            babble: ral::read_reg!(crate::ptd, &w, DW3, BABBLE == 1),
            halt: ral::read_reg!(crate::ptd, &w, DW3, HALT == 1),
            active: ral::read_reg!(crate::ptd, &w, DW3, ACTIVE == 1),
            microframes: ral::read_reg!(crate::ptd, &w, DW4, MICROFRAMES) as u8,
            microframe_status: ral::read_reg!(crate::ptd, &w, DW4, STATUS),
            complete_split: ral::read_reg!(crate::ptd, &w, DW5, COMPLETE_SPLIT) as u8,
        }
    }

    /// Encode the PTD into its chip byte image
    pub fn to_bytes(&self) -> [u8; PTD_SIZE] {
        let mut bytes = [0; PTD_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Decode a PTD from its chip byte image
    pub fn from_bytes(bytes: &[u8; PTD_SIZE]) -> Self {
        let mut words = [0; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_words(words)
    }

    /// Returns the chip address of the payload block
    #[cfg(test)]
    pub fn payload_address(&self) -> u32 {
        ((self.start_address as u32) << 3) + ISO_PTD_OFFSET
    }

    /// Returns the number of bytes the hardware moved
    ///
    /// Split interrupt transactions only report 11 bits.
    pub fn transferred_bytes(&self, split_interrupt: bool) -> usize {
        if split_interrupt {
            (self.transferred & 0x7ff) as usize
        } else {
            self.transferred as usize
        }
    }

    /// Prepare the PTD to retry the same transaction
    pub fn rearm(&mut self, counters: &RetryCounters) {
        self.valid = true;
        self.active = true;
        self.nak_count = self.reload;
        self.cerr = counters.cerr;
    }
}

/// Build an asynchronous PTD for `qtd`
///
/// `toggle` and `ping` come from the endpoint's queue head. `last` is set when
/// `qtd` is the last QTD of its URB.
pub fn create_atl(
    qtd: &Qtd,
    pipe: &Pipe,
    toggle: bool,
    ping: bool,
    last: bool,
    counters: &RetryCounters,
) -> Ptd {
    let raw_max_packet = pipe.max_packet_size as u32;
    let mut ptd = Ptd {
        valid: true,
        length: qtd.length as u16,
        max_packet: (raw_max_packet & 0x7ff) as u16,
        endpoint: pipe.endpoint(),
        device_address: pipe.device.address,
        token: qtd.packet_type,
        transfer_type: TransferType::of(pipe.kind),
        start_address: if qtd.payload_addr != 0 {
            base_to_chip(qtd.payload_addr) as u16
        } else {
            0
        },
        reload: counters.reload,
        nak_count: counters.nak,
        cerr: counters.cerr,
        active: true,
        ..Default::default()
    };

    if pipe.device.needs_split() {
        ptd.split = true;
        ptd.low_speed = pipe.device.speed == Speed::Low;
        match pipe.device.tt {
            Some(tt) => {
                ptd.port = tt.port;
                ptd.hub = tt.hub_address;
            }
            None => {
                warn!(
                    "Device {=u8} needs a split, but has no TT",
                    pipe.device.address
                );
            }
        }
        // Split transactions must not use the NAK reload.
        ptd.reload = 0;
        ptd.nak_count = 0;
    } else {
        ptd.multi = (1 + ((raw_max_packet >> 11) & 0x3)) as u8;
        if matches!(pipe.kind, EndpointType::Control | EndpointType::Bulk) {
            ptd.ping = ping;
        }
    }

    ptd.toggle = toggle;
    if pipe.kind == EndpointType::Control {
        if qtd.packet_type == PacketType::Setup {
            ptd.toggle = false;
        } else if last {
            ptd.toggle = true;
        }
    }

    ptd
}

/// Build a periodic PTD for `qtd`
///
/// This is an asynchronous PTD, plus the polling schedule.
pub fn create_int(
    qtd: &Qtd,
    pipe: &Pipe,
    toggle: bool,
    ping: bool,
    last: bool,
    counters: &RetryCounters,
) -> Ptd {
    let mut ptd = create_atl(qtd, pipe, toggle, ping, last, counters);
    let interval = pipe.interval as u32;

    let (period, microframes) = if pipe.device.needs_split() {
        ptd.complete_split = 0xff;
        (interval, 0x0f)
    } else {
        let microframes = if interval > 4 {
            0x01
        } else if interval > 2 {
            0x22
        } else if interval > 1 {
            0x55
        } else {
            0xff
        };
        (interval >> 3, microframes)
    };

    ptd.period = ((period >> 1) & 0xf8) as u8;
    ptd.microframes = microframes;
    ptd
}

/// What to do with a completed PTD
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtdState {
    /// The transaction finished
    Done,
    /// Send the same PTD again
    Reload,
    /// Give up on the transaction, and the rest of the URB
    Retire(Error),
}

/// Classify an asynchronous PTD that the hardware handed back
pub fn check_atl(ptd: &Ptd) -> PtdState {
    if ptd.halt {
        let error = if ptd.babble {
            Error::Overflow
        } else if ptd.cerr != 0 {
            // Halted with errors to spare; must be a STALL handshake.
            Error::Stall
        } else {
            Error::Protocol
        };
        PtdState::Retire(error)
    } else if ptd.error && ptd.active {
        // Transaction error, but the hardware left it active. Try again.
        PtdState::Reload
    } else if ptd.nak_count == 0 && ptd.active {
        PtdState::Reload
    } else {
        PtdState::Done
    }
}

/// Classify a periodic PTD that the hardware handed back
pub fn check_int(ptd: &Ptd) -> PtdState {
    if !ptd.halt {
        return PtdState::Done;
    }

    let mut error = Error::Protocol;
    for microframe in 0..8 {
        match (ptd.microframe_status >> (microframe * 3)) & 0b111 {
            INT_UNDERRUN => error = Error::CommFailure,
            INT_BABBLE => error = Error::Overflow,
            INT_EXACT => error = Error::Protocol,
            _ => {}
        }
    }
    PtdState::Retire(error)
}
