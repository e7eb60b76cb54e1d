//! Interrupt-safe host controller adapter

use crate::{
    access::ChipAccess,
    driver::{Controller, TtClearRequest, UrbId},
    urb::{EndpointKey, Urb},
    Error,
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::control::Request;

/// A host controller that you can share with an interrupt handler
///
/// `HostAdapter` puts the [`Controller`] behind a critical section. Call
/// [`on_interrupt()`](HostAdapter::on_interrupt) from the host controller's
/// interrupt handler, and [`tick()`](HostAdapter::tick) from a periodic timer.
/// Everything else can be called from thread mode.
pub struct HostAdapter<C, B> {
    controller: Mutex<RefCell<Controller<C, B>>>,
}

impl<C: ChipAccess, B: AsRef<[u8]> + AsMut<[u8]>> HostAdapter<C, B> {
    /// Wrap a controller
    ///
    /// Make sure you've started the controller before sharing it.
    pub fn new(controller: Controller<C, B>) -> Self {
        HostAdapter {
            controller: Mutex::new(RefCell::new(controller)),
        }
    }

    /// Interrupt-safe, immutable access to the controller
    pub fn with_controller<R>(&self, func: impl FnOnce(&Controller<C, B>) -> R) -> R {
        interrupt::free(|cs| {
            let controller = self.controller.borrow(cs);
            let controller = controller.borrow();
            func(&*controller)
        })
    }

    /// Interrupt-safe, mutable access to the controller
    pub fn with_controller_mut<R>(&self, func: impl FnOnce(&mut Controller<C, B>) -> R) -> R {
        interrupt::free(|cs| {
            let controller = self.controller.borrow(cs);
            let mut controller = controller.borrow_mut();
            func(&mut *controller)
        })
    }

    /// See [`Controller::enqueue`]
    pub fn enqueue(&self, urb: Urb<B>) -> Result<UrbId, (Error, Urb<B>)> {
        self.with_controller_mut(|controller| controller.enqueue(urb))
    }

    /// See [`Controller::dequeue`]
    pub fn dequeue(&self, id: UrbId, status: Error) -> Result<(), Error> {
        self.with_controller_mut(|controller| controller.dequeue(id, status))
    }

    /// See [`Controller::endpoint_disable`]
    pub fn endpoint_disable(&self, key: EndpointKey) {
        self.with_controller_mut(|controller| controller.endpoint_disable(key))
    }

    /// Handle the host controller interrupt
    ///
    /// Returns `false` if the interrupt wasn't ours.
    pub fn on_interrupt(&self) -> bool {
        self.with_controller_mut(|controller| controller.interrupt())
    }

    /// See [`Controller::tick`]
    pub fn tick(&self, now_ms: u32) {
        self.with_controller_mut(|controller| controller.tick(now_ms))
    }

    /// See [`Controller::pop_completed`]
    pub fn pop_completed(&self) -> Option<(UrbId, Urb<B>)> {
        self.with_controller_mut(|controller| controller.pop_completed())
    }

    pub fn take_tt_clear_request(&self) -> Option<TtClearRequest> {
        self.with_controller_mut(|controller| controller.take_tt_clear_request())
    }

    pub fn clear_tt_buffer_complete(&self, key: EndpointKey) {
        self.with_controller_mut(|controller| controller.clear_tt_buffer_complete(key))
    }

    pub fn frame_number(&self) -> u32 {
        self.with_controller_mut(|controller| controller.frame_number())
    }

    /// See [`Controller::hub_control`]
    pub fn hub_control(
        &self,
        request: &Request,
        buf: &mut [u8],
        now_ms: u32,
    ) -> Result<usize, Error> {
        self.with_controller_mut(|controller| controller.hub_control(request, buf, now_ms))
    }

    pub fn hub_status_data(&self, now_ms: u32) -> u8 {
        self.with_controller_mut(|controller| controller.hub_status_data(now_ms))
    }
}
