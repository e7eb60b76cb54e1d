//! Root hub emulation
//!
//! The chip has one downstream port, behind an integrated transaction
//! translator. The USB core drives it with ordinary hub class requests; we
//! answer them from the port status register.

use crate::{
    access::ChipAccess,
    ral::{PortSc, Reg},
    Error,
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

/// Hub class descriptor type
const DESCRIPTOR_HUB: u8 = 0x29;
/// Only one downstream port
const PORT_COUNT: u8 = 1;

/// Time that a port reset is driven, in milliseconds
const RESET_MS: u32 = 50;
/// Time that resume signaling is driven, in milliseconds
const RESUME_MS: u32 = 40;
/// How many status reads to wait for the port to acknowledge a command
const HANDSHAKE_TRIES: usize = 1000;

/// Port status change bits that are cleared by writing one
const PORTSC_CHANGE_BITS: PortSc = PortSc::CONNECT_CHANGE
    .union(PortSc::ENABLE_CHANGE)
    .union(PortSc::OVER_CURRENT_CHANGE);

bitflags::bitflags! {
    /// `wPortStatus` (low half) and `wPortChange` (high half)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;

        const C_CONNECTION = 1 << 16;
        const C_ENABLE = 1 << 17;
        const C_SUSPEND = 1 << 18;
        const C_OVER_CURRENT = 1 << 19;
        const C_RESET = 1 << 20;
    }
}

/// Hub class port feature selectors
mod feature {
    pub const ENABLE: u16 = 1;
    pub const SUSPEND: u16 = 2;
    pub const OVER_CURRENT: u16 = 3;
    pub const RESET: u16 = 4;
    pub const POWER: u16 = 8;
    pub const C_CONNECTION: u16 = 16;
    pub const C_ENABLE: u16 = 17;
    pub const C_SUSPEND: u16 = 18;
    pub const C_OVER_CURRENT: u16 = 19;
    pub const C_RESET: u16 = 20;
}

/// `wHubCharacteristics`
const HUB_CHAR_PER_PORT_POWER: u16 = 0x0001;
const HUB_CHAR_NO_POWER_SWITCHING: u16 = 0x0002;
const HUB_CHAR_PER_PORT_OVER_CURRENT: u16 = 0x0008;

/// Root hub state
pub struct RootHub {
    /// Deadline for the reset or resume in progress
    reset_done: Option<u32>,
    port_power_control: bool,
}

/// Elapsed-time comparison that survives the millisecond counter wrapping
fn reached(now_ms: u32, deadline: u32) -> bool {
    now_ms.wrapping_sub(deadline) as i32 >= 0
}

impl RootHub {
    pub const fn new(port_power_control: bool) -> Self {
        RootHub {
            reset_done: None,
            port_power_control,
        }
    }

    fn descriptor(&self) -> [u8; 9] {
        let characteristics = HUB_CHAR_PER_PORT_OVER_CURRENT
            | if self.port_power_control {
                HUB_CHAR_PER_PORT_POWER
            } else {
                HUB_CHAR_NO_POWER_SWITCHING
            };
        let [lo, hi] = characteristics.to_le_bytes();
        [
            9,
            DESCRIPTOR_HUB,
            PORT_COUNT,
            lo,
            hi,
            10, // bPwrOn2PwrGood, 2ms units
            0,  // bHubContrCurrent
            0x00, // DeviceRemovable
            0xff, // PortPwrCtrlMask
        ]
    }

    /// Handle a hub class request
    ///
    /// On success, returns the number of bytes written into `buf`. Requests
    /// that a real hub would STALL return [`Error::Stall`].
    pub fn control<C: ChipAccess>(
        &mut self,
        chip: &mut C,
        request: &Request,
        buf: &mut [u8],
        now_ms: u32,
    ) -> Result<usize, Error> {
        if request.request_type != RequestType::Class {
            return Err(Error::Stall);
        }

        match (request.direction, request.recipient, request.request) {
            (UsbDirection::In, Recipient::Device, Request::GET_DESCRIPTOR) => {
                if (request.value >> 8) as u8 != DESCRIPTOR_HUB {
                    return Err(Error::Stall);
                }
                let descriptor = self.descriptor();
                Ok(copy_reply(&descriptor, request, buf))
            }
            (UsbDirection::In, Recipient::Device, Request::GET_STATUS) => {
                Ok(copy_reply(&[0; 4], request, buf))
            }
            (UsbDirection::Out, Recipient::Device, Request::CLEAR_FEATURE) => {
                // Local power and over-current changes are never reported.
                Ok(0)
            }
            (UsbDirection::In, Recipient::Other, Request::GET_STATUS) => {
                check_port(request)?;
                let status = self.port_status(chip, now_ms)?;
                debug!("PORT STATUS {=u32:X}", status.bits());
                Ok(copy_reply(&status.bits().to_le_bytes(), request, buf))
            }
            (UsbDirection::Out, Recipient::Other, Request::SET_FEATURE) => {
                check_port(request)?;
                self.set_port_feature(chip, request.value, now_ms)?;
                Ok(0)
            }
            (UsbDirection::Out, Recipient::Other, Request::CLEAR_FEATURE) => {
                check_port(request)?;
                self.clear_port_feature(chip, request.value, now_ms)?;
                Ok(0)
            }
            _ => {
                warn!("Unsupported hub request {=u8}", request.request);
                Err(Error::Stall)
            }
        }
    }

    /// Returns the port change bitmap for the hub's status endpoint
    ///
    /// Bit 1 is set when port 1 has a change to report.
    pub fn status_data<C: ChipAccess>(&mut self, chip: &mut C, now_ms: u32) -> u8 {
        let portsc = read_portsc(chip);
        if portsc.contains(PortSc::OWNER) {
            // A companion owns the port; swallow its connect changes.
            if portsc.contains(PortSc::CONNECT_CHANGE) {
                write_portsc(chip, portsc, PortSc::CONNECT_CHANGE);
            }
            return 0;
        }

        let resumed = portsc.contains(PortSc::RESUME)
            && self.reset_done.map_or(false, |deadline| reached(now_ms, deadline));
        if portsc.contains(PortSc::CONNECT_CHANGE) || resumed {
            1 << 1
        } else {
            0
        }
    }

    fn port_status<C: ChipAccess>(
        &mut self,
        chip: &mut C,
        now_ms: u32,
    ) -> Result<PortStatus, Error> {
        let mut portsc = read_portsc(chip);
        let mut status = PortStatus::empty();

        if portsc.contains(PortSc::CONNECT_CHANGE) {
            status |= PortStatus::C_CONNECTION;
        }

        if portsc.contains(PortSc::RESUME) {
            match self.reset_done {
                // Remote wakeup; time the resume signaling from now.
                None => self.reset_done = Some(now_ms.wrapping_add(RESUME_MS)),
                Some(deadline) if reached(now_ms, deadline) => {
                    status |= PortStatus::C_SUSPEND;
                    self.reset_done = None;
                    write_portsc(
                        chip,
                        portsc.difference(PortSc::RESUME | PortSc::SUSPEND),
                        PortSc::empty(),
                    );
                    portsc = handshake(chip, PortSc::RESUME)?;
                }
                Some(_) => {}
            }
        }

        if portsc.contains(PortSc::RESET)
            && self.reset_done.map_or(true, |deadline| reached(now_ms, deadline))
        {
            status |= PortStatus::C_RESET;
            self.reset_done = None;
            write_portsc(chip, portsc.difference(PortSc::RESET), PortSc::empty());
            portsc = handshake(chip, PortSc::RESET)?;
        }

        if portsc.contains(PortSc::OWNER) {
            warn!("Port is owned by a companion controller");
        }
        if portsc.contains(PortSc::CONNECT) {
            // Everything looks high speed through the integrated TT.
            status |= PortStatus::CONNECTION | PortStatus::HIGH_SPEED;
        }
        if portsc.contains(PortSc::ENABLE) {
            status |= PortStatus::ENABLE;
        }
        if portsc.intersects(PortSc::SUSPEND | PortSc::RESUME) {
            status |= PortStatus::SUSPEND;
        }
        if portsc.contains(PortSc::RESET) {
            status |= PortStatus::RESET;
        }
        if portsc.contains(PortSc::POWER) {
            status |= PortStatus::POWER;
        }
        Ok(status)
    }

    fn set_port_feature<C: ChipAccess>(
        &mut self,
        chip: &mut C,
        selector: u16,
        now_ms: u32,
    ) -> Result<(), Error> {
        let portsc = read_portsc(chip);
        if portsc.contains(PortSc::OWNER) {
            return Ok(());
        }

        match selector {
            feature::SUSPEND => {
                if !portsc.contains(PortSc::ENABLE) || portsc.contains(PortSc::RESET) {
                    return Err(Error::Stall);
                }
                write_portsc(chip, portsc | PortSc::SUSPEND, PortSc::empty());
            }
            feature::POWER => {
                if self.port_power_control {
                    write_portsc(chip, portsc | PortSc::POWER, PortSc::empty());
                }
            }
            feature::RESET => {
                if portsc.contains(PortSc::RESUME) {
                    return Err(Error::Stall);
                }
                // A low speed device on a disabled port belongs to a
                // companion controller.
                let connected_disabled = portsc.contains(PortSc::CONNECT)
                    && !portsc.contains(PortSc::ENABLE);
                if connected_disabled && portsc.line_status() == 1 {
                    debug!("Low speed device; releasing the port");
                    write_portsc(chip, portsc | PortSc::OWNER, PortSc::empty());
                } else {
                    let next = (portsc | PortSc::RESET).difference(PortSc::ENABLE);
                    write_portsc(chip, next, PortSc::empty());
                    self.reset_done = Some(now_ms.wrapping_add(RESET_MS));
                }
            }
            _ => return Err(Error::Stall),
        }
        Ok(())
    }

    fn clear_port_feature<C: ChipAccess>(
        &mut self,
        chip: &mut C,
        selector: u16,
        now_ms: u32,
    ) -> Result<(), Error> {
        let portsc = read_portsc(chip);
        match selector {
            feature::ENABLE => {
                write_portsc(chip, portsc.difference(PortSc::ENABLE), PortSc::empty());
            }
            feature::SUSPEND => {
                if portsc.contains(PortSc::RESET) {
                    return Err(Error::Stall);
                }
                if portsc.contains(PortSc::SUSPEND) {
                    if !portsc.contains(PortSc::ENABLE) {
                        return Err(Error::Stall);
                    }
                    write_portsc(chip, portsc | PortSc::RESUME, PortSc::CONNECT_CHANGE);
                    self.reset_done = Some(now_ms.wrapping_add(RESUME_MS));
                }
            }
            feature::POWER => {
                if self.port_power_control {
                    write_portsc(chip, portsc.difference(PortSc::POWER), PortSc::empty());
                }
            }
            feature::C_CONNECTION => {
                write_portsc(chip, portsc, PortSc::CONNECT_CHANGE);
            }
            // Cleared when the status is read, or never reported.
            feature::C_SUSPEND
            | feature::C_ENABLE
            | feature::C_OVER_CURRENT
            | feature::C_RESET
            | feature::OVER_CURRENT => {}
            _ => return Err(Error::Stall),
        }
        Ok(())
    }
}

fn check_port(request: &Request) -> Result<(), Error> {
    if request.index == PORT_COUNT as u16 {
        Ok(())
    } else {
        Err(Error::Stall)
    }
}

fn copy_reply(reply: &[u8], request: &Request, buf: &mut [u8]) -> usize {
    let len = reply.len().min(buf.len()).min(request.length as usize);
    buf[..len].copy_from_slice(&reply[..len]);
    len
}

fn read_portsc<C: ChipAccess>(chip: &mut C) -> PortSc {
    PortSc::from_bits_retain(chip.read_reg(Reg::PortSc1))
}

/// Write the port status register
///
/// `value`'s change bits are dropped so that a read-modify-write never
/// acknowledges a change by accident. Changes named in `acknowledge` are
/// written as ones, which clears them.
fn write_portsc<C: ChipAccess>(chip: &mut C, value: PortSc, acknowledge: PortSc) {
    let value = value.difference(PORTSC_CHANGE_BITS) | (acknowledge & PORTSC_CHANGE_BITS);
    chip.write_reg(Reg::PortSc1, value.bits());
}

/// Wait for the port to clear `bits`
fn handshake<C: ChipAccess>(chip: &mut C, bits: PortSc) -> Result<PortSc, Error> {
    for _ in 0..HANDSHAKE_TRIES {
        let portsc = read_portsc(chip);
        if !portsc.intersects(bits) {
            return Ok(portsc);
        }
    }
    warn!("Port didn't acknowledge {=u32:X}", bits.bits());
    Err(Error::Protocol)
}
