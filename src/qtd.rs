//! Queue transfer descriptors
//!
//! A QTD is the software description of one hardware transaction; it never
//! moves more data than fits in one payload block. The packetizer turns a URB
//! into a chain of QTDs, and the scheduler moves each QTD through its states.

use crate::{
    qh::QH_DEPTH,
    urb::{Urb, UrbFlags, SETUP_PACKET_LEN},
    Error,
};
use usb_device::endpoint::EndpointType;

/// The most QTDs that a single URB can produce
///
/// A URB's QTDs all live in one queue head, so this is the queue head depth.
pub const MAX_QTDS_PER_URB: usize = QH_DEPTH;

/// PID token, encoded as the chip expects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    #[default]
    Out = 0,
    In = 1,
    Setup = 2,
}

impl PacketType {
    pub(crate) fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(PacketType::Out),
            1 => Some(PacketType::In),
            2 => Some(PacketType::Setup),
            _ => None,
        }
    }

    /// The direction of a control transfer's status stage
    fn status_stage(self) -> Self {
        match self {
            PacketType::In => PacketType::Out,
            _ => PacketType::In,
        }
    }
}

/// QTD state
///
/// States only move forward, with one exception: a transaction that needs a
/// reload goes from `XferStarted` back to `PayloadAlloc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QtdStatus {
    /// Created, no payload memory
    Enqueued,
    /// Payload memory is assigned, OUT data is written
    PayloadAlloc,
    /// In a slot
    XferStarted,
    /// The hardware finished the transaction
    XferComplete,
    /// Dropped; the URB failed or was cancelled
    Retire,
}

/// Where a QTD's data lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRef {
    /// The URB's setup packet
    Setup,
    /// The URB's buffer, starting at this offset
    Buffer(usize),
    /// No data
    Empty,
}

/// A queue transfer descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Qtd {
    /// Index of the owning URB
    pub(crate) urb: usize,
    pub(crate) packet_type: PacketType,
    pub(crate) data: DataRef,
    pub(crate) length: usize,
    /// Payload block address, or zero when the QTD doesn't own memory
    pub(crate) payload_addr: u32,
    pub(crate) status: QtdStatus,
    pub(crate) actual_length: usize,
}

impl Qtd {
    pub(crate) const fn new(
        urb: usize,
        packet_type: PacketType,
        data: DataRef,
        length: usize,
    ) -> Self {
        Qtd {
            urb,
            packet_type,
            data,
            length,
            payload_addr: 0,
            status: QtdStatus::Enqueued,
            actual_length: 0,
        }
    }
}

/// The QTDs for one URB, in transfer order
pub type QtdChain = heapless::Vec<Qtd, MAX_QTDS_PER_URB>;

fn push(chain: &mut QtdChain, qtd: Qtd) -> Result<(), Error> {
    chain.push(qtd).map_err(|_| {
        warn!("URB needs more than {=usize} QTDs", MAX_QTDS_PER_URB);
        Error::NoMemory
    })
}

/// Split `urb` into QTDs that are each at most `max_chunk` bytes
///
/// Control transfers start with an 8 byte SETUP QTD, and end with a zero-length
/// status QTD that runs opposite the data stage. A control transfer without a
/// data stage has only the SETUP and an IN status stage. Bulk OUT transfers
/// that ask for a zero-length packet, and that fill the last packet, get one
/// more zero-length QTD.
pub fn packetize<B>(urb: &Urb<B>, urb_index: usize, max_chunk: usize) -> Result<QtdChain, Error> {
    let pipe = urb.pipe();
    let length = urb.length();
    if max_chunk == 0 && length > 0 {
        return Err(Error::InvalidArgument);
    }

    let mut chain = QtdChain::new();
    let mut packet_type = if pipe.is_in() {
        PacketType::In
    } else {
        PacketType::Out
    };

    let control = pipe.kind == EndpointType::Control;
    if control {
        push(
            &mut chain,
            Qtd::new(
                urb_index,
                PacketType::Setup,
                DataRef::Setup,
                SETUP_PACKET_LEN,
            ),
        )?;
        if length == 0 {
            packet_type = PacketType::In;
        }
    }

    let mut offset = 0;
    loop {
        let chunk = (length - offset).min(max_chunk);
        let data = if chunk == 0 {
            DataRef::Empty
        } else {
            DataRef::Buffer(offset)
        };
        push(&mut chain, Qtd::new(urb_index, packet_type, data, chunk))?;
        offset += chunk;
        if offset >= length {
            break;
        }
    }

    if length != 0 {
        let terminate = if control {
            packet_type = packet_type.status_stage();
            true
        } else {
            let max_packet = pipe.max_packet();
            pipe.kind == EndpointType::Bulk
                && urb.flags().contains(UrbFlags::ZERO_PACKET)
                && max_packet != 0
                && length % max_packet == 0
        };
        if terminate {
            push(
                &mut chain,
                Qtd::new(urb_index, packet_type, DataRef::Empty, 0),
            )?;
        }
    }

    Ok(chain)
}
