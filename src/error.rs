//! Transfer and API errors

/// Errors reported by the host controller
///
/// The first group describes why a URB finished unsuccessfully, and shows up
/// in [`Urb::status()`](crate::Urb::status). The second group is returned
/// by the controller's entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// CRC error, timeout, bad PID, or any other unclassified transaction
    /// failure.
    Protocol,
    /// The endpoint responded with a STALL handshake.
    Stall,
    /// The device babbled, or sent more data than the buffer holds.
    Overflow,
    /// An interrupt transfer underran.
    CommFailure,
    /// A short transfer completed on a URB that asked for the full length.
    RemoteIo,
    /// The URB was cancelled by the USB core.
    Cancelled,
    /// The USB core cancelled the URB because its deadline expired.
    CancelTimeout,

    /// No room to track another URB, endpoint, or transfer descriptor.
    NoMemory,
    /// The request uses an unsupported transfer type.
    Unsupported,
    /// The URB or request is malformed.
    InvalidArgument,
    /// The URB is not owned by the controller.
    NotQueued,
}

impl Error {
    /// Returns the negative errno value that the Linux USB core would use
    /// for this condition
    ///
    /// Useful when bridging to a USB stack that speaks in errno values.
    pub const fn errno(self) -> i32 {
        match self {
            Error::Protocol => -71,       // EPROTO
            Error::Stall => -32,          // EPIPE
            Error::Overflow => -75,       // EOVERFLOW
            Error::CommFailure => -70,    // ECOMM
            Error::RemoteIo => -121,      // EREMOTEIO
            Error::Cancelled => -104,     // ECONNRESET
            Error::CancelTimeout => -110, // ETIMEDOUT
            Error::NoMemory => -12,       // ENOMEM
            Error::Unsupported => -32,    // EPIPE, same as Linux for ISO
            Error::InvalidArgument => -22,
            Error::NotQueued => -43, // EIDRM
        }
    }
}
