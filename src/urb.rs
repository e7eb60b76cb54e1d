//! USB request blocks, and the pipes they travel on
//!
//! A URB belongs to the USB core. The core lends it to the controller with
//! [`enqueue()`](crate::Controller::enqueue), and gets it back, with a final
//! status, from [`pop_completed()`](crate::Controller::pop_completed).

use crate::Error;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Size of a control transfer's setup packet
pub const SETUP_PACKET_LEN: usize = 8;

/// Device bus speed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
    /// 480 Mbit/s
    High,
}

/// Where a full / low speed device's transaction translator lives
///
/// Every full or low speed device sits behind a high-speed hub, even if
/// that hub is the chip's integrated hub. The USB core resolves this once,
/// during enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtLocation {
    /// Bus address of the hub that owns the transaction translator
    pub hub_address: u8,
    /// Hub port that the device is attached to
    pub port: u8,
}

/// The device side of a pipe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Device {
    /// Bus address, 0 through 127
    pub address: u8,
    /// Negotiated speed
    pub speed: Speed,
    /// Transaction translator, if the device isn't high speed
    pub tt: Option<TtLocation>,
}

impl Device {
    /// A high-speed device at `address`
    pub const fn high_speed(address: u8) -> Self {
        Device {
            address,
            speed: Speed::High,
            tt: None,
        }
    }

    /// A full or low speed device at `address`, behind `tt`
    pub const fn behind_hub(address: u8, speed: Speed, tt: TtLocation) -> Self {
        Device {
            address,
            speed,
            tt: Some(tt),
        }
    }

    /// Indicates if transfers to this device need split transactions
    pub fn needs_split(&self) -> bool {
        self.speed != Speed::High
    }
}

/// Identifies one endpoint of one device
///
/// Control endpoints are bidirectional, so their key always uses
/// [`UsbDirection::Out`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointKey {
    /// Device bus address
    pub device: u8,
    /// Endpoint number and direction
    pub address: EndpointAddress,
}

/// A transfer direction, type, and destination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pipe {
    /// The target device
    pub device: Device,
    /// Endpoint number, and the transfer direction
    ///
    /// For control pipes, the direction is the direction of the data stage.
    pub address: EndpointAddress,
    /// Transfer type
    pub kind: EndpointType,
    /// Raw `wMaxPacketSize`, including the high-bandwidth multiplier bits
    pub max_packet_size: u16,
    /// Polling interval for interrupt pipes
    ///
    /// Microframes for high-speed devices, frames otherwise.
    pub interval: u16,
}

impl Pipe {
    /// Create a pipe
    pub const fn new(
        device: Device,
        address: EndpointAddress,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Self {
        Pipe {
            device,
            address,
            kind,
            max_packet_size,
            interval: 0,
        }
    }

    /// Set the polling interval
    pub const fn with_interval(mut self, interval: u16) -> Self {
        self.interval = interval;
        self
    }

    /// Returns the endpoint number
    pub fn endpoint(&self) -> u8 {
        self.address.index() as u8
    }

    /// Indicates if data moves from the device to the host
    pub fn is_in(&self) -> bool {
        self.address.direction() == UsbDirection::In
    }

    /// Returns the max packet length, without the multiplier bits
    pub fn max_packet(&self) -> usize {
        (self.max_packet_size & 0x7ff) as usize
    }

    /// Returns the key for the endpoint that carries this pipe
    pub fn key(&self) -> EndpointKey {
        let address = if self.kind == EndpointType::Control {
            EndpointAddress::from_parts(self.address.index(), UsbDirection::Out)
        } else {
            self.address
        };
        EndpointKey {
            device: self.device.address,
            address,
        }
    }
}

bitflags::bitflags! {
    /// URB transfer flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UrbFlags: u32 {
        /// Terminate a bulk OUT transfer that's a multiple of the max packet
        /// length with a zero-length packet.
        const ZERO_PACKET = 1 << 0;
        /// Treat a short bulk transfer as an error.
        const SHORT_NOT_OK = 1 << 1;
    }
}

/// A USB request block
///
/// `B` is the transfer buffer. For OUT transfers, the controller reads the first
/// [`length()`](Urb::length) bytes. For IN transfers, the controller writes up to
/// `length()` bytes.
#[derive(Debug)]
pub struct Urb<B> {
    pipe: Pipe,
    setup: [u8; SETUP_PACKET_LEN],
    buffer: B,
    length: usize,
    flags: UrbFlags,
    pub(crate) actual_length: usize,
    pub(crate) status: Result<(), Error>,
}

impl<B: AsRef<[u8]>> Urb<B> {
    /// Create a URB that transfers the whole `buffer`
    pub fn new(pipe: Pipe, buffer: B) -> Self {
        let length = buffer.as_ref().len();
        Urb {
            pipe,
            setup: [0; SETUP_PACKET_LEN],
            buffer,
            length,
            flags: UrbFlags::empty(),
            actual_length: 0,
            status: Ok(()),
        }
    }
}

impl<B> Urb<B> {
    /// Set the setup packet for a control transfer
    pub fn with_setup(mut self, setup: [u8; SETUP_PACKET_LEN]) -> Self {
        self.setup = setup;
        self
    }

    /// Transfer only the first `length` bytes of the buffer
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Set transfer flags
    pub fn with_flags(mut self, flags: UrbFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns the pipe
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// Returns the setup packet
    pub fn setup(&self) -> &[u8; SETUP_PACKET_LEN] {
        &self.setup
    }

    /// Returns the requested transfer length
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the transfer flags
    pub fn flags(&self) -> UrbFlags {
        self.flags
    }

    /// Returns the number of data bytes that were transferred
    ///
    /// Setup packets aren't counted.
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Returns the transfer status
    ///
    /// `Ok` while the transfer is queued, and after it successfully completes.
    pub fn status(&self) -> Result<(), Error> {
        self.status
    }

    /// Returns the transfer buffer
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Returns the transfer buffer
    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    /// Release the transfer buffer
    pub fn into_buffer(self) -> B {
        self.buffer
    }
}
