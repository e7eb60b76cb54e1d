//! A transfer scheduler for ISP176x USB 2.0 host controllers
//!
//! `isp176x-hcd` drives the NXP ISP1760, ISP1761, and ISP1763 host controllers.
//! It splits USB transfers into chunks that fit the chip's payload memory,
//! places them into the chip's PTD slots, and turns the chip's completion
//! reports back into finished transfers. Control, bulk, and interrupt
//! transfers are supported, including split transactions to full and low
//! speed devices behind a hub.
//!
//! The crate doesn't enumerate devices. Pair it with a USB host stack that
//! submits [`Urb`]s, and forwards hub class requests to
//! [`Controller::hub_control`].
//!
//! To reach the chip, either implement [`ChipAccess`] yourself, or define a
//! safe implementation of [`Peripherals`], and use [`MmioBlock`] with one of
//! the memory adapters, [`BankedWindow`] or [`DataPort`].
//!
//! ```ignore
//! use isp176x_hcd::{BankedWindow, Config, Controller, HostAdapter, MmioBlock, RegisterMap};
//!
//! let mmio = MmioBlock::new(&my_peripherals, 600);
//! let chip = BankedWindow::new(mmio, RegisterMap::ISP1760);
//! let mut controller = Controller::<_, &'static mut [u8]>::new(chip, Config::default())?;
//! controller.start();
//! let host = HostAdapter::new(controller);
//! ```

#![no_std]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod access;
mod bus;
mod driver;
mod error;
mod hub;
mod memory;
mod ptd;
mod qh;
mod qtd;
mod ral;
mod slots;
mod urb;

#[cfg(test)]
mod sim;

pub use access::{BankedWindow, ChipAccess, DataPort, Mmio, MmioBlock};
pub use bus::HostAdapter;
pub use driver::{
    Config, Controller, TtClearRequest, UrbId, MAX_QHS, MAX_QTDS, MAX_URBS, SLOT_CHECK_PERIOD_MS,
};
pub use error::Error;
pub use memory::{BlockGroup, MemoryLayout};
pub use ptd::RetryCounters;
pub use ral::{Reg, RegisterMap};
pub use urb::{Device, EndpointKey, Pipe, Speed, TtLocation, Urb, UrbFlags, SETUP_PACKET_LEN};

/// A type that owns the host controller's register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// memory-mapped register block of one ISP176x chip. The pointer returned
/// by `host_controller` is assumed to be valid for the chip's entire
/// register window, and will be cast to a register definition.
///
/// # Example
///
/// ```
/// use isp176x_hcd::Peripherals;
///
/// /// The chip sits on the external memory bus
/// struct Isp1761 {
///     _private: (),
/// }
///
/// unsafe impl Peripherals for Isp1761 {
///     fn host_controller(&self) -> *const () {
///         0x6000_0000 as *const ()
///     }
/// }
///
/// let chip = Isp1761 { _private: () };
/// assert_eq!(chip.host_controller(), 0x6000_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the host controller registers
    fn host_controller(&self) -> *const ();
}
