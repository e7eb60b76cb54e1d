//! Host controller driver
//!
//! `Controller` owns the chip and all scheduler state: the payload memory pool,
//! the ATL and INT slot tables, and arenas of queue heads, QTDs, and URBs. It's
//! single threaded; the only concurrent actor is the chip, working through
//! the PTDs we armed. Wrap it in a [`HostAdapter`](crate::HostAdapter) to share
//! it with an interrupt handler.
//!
//! Every pass through the scheduler harvests first, then feeds. Harvesting
//! collects finished QTDs, copies IN data out of the chip, and queues finished
//! URBs for giveback. Feeding hands pending QTDs to free slots, control
//! endpoints first, then bulk, then interrupt.

use crate::{
    access::ChipAccess,
    hub::RootHub,
    memory::{MemoryLayout, Pool},
    ptd::{self, Ptd, PtdState, RetryCounters, ISO_PTD_OFFSET, PTD_SIZE},
    qh::{Qh, QueueKind},
    qtd::{self, DataRef, PacketType, QtdStatus},
    ral::{BufferStatus, Interrupts, Reg},
    slots::{Slot, SlotTable, Table, MAX_SLOTS},
    urb::{Device, EndpointKey, Urb, UrbFlags},
    Error,
};
use usb_device::{control::Request, endpoint::EndpointType};

/// Most endpoints with queued work, or state to remember
pub const MAX_QHS: usize = 32;
/// Most QTDs, across all endpoints
pub const MAX_QTDS: usize = 128;
/// Most URBs owned by the controller, including completed URBs that
/// wait for [`pop_completed()`](Controller::pop_completed)
pub const MAX_URBS: usize = 32;
/// How often to call [`tick()`](Controller::tick), in milliseconds
pub const SLOT_CHECK_PERIOD_MS: u32 = 200;

/// QTDs per endpoint that may own payload memory at once
const ENQUEUE_DEPTH: usize = 2;
/// Outstanding Clear-TT-Buffer requests
const MAX_TT_REQUESTS: usize = 8;
/// An ATL slot this old, with a finished PTD, lost its done bit
const SLOT_TIMEOUT_MS: u32 = 300;
/// Frames in the periodic schedule
const PERIODIC_SIZE: u32 = 1024;
const ALL_SLOTS: u32 = 0xffff_ffff;

/// Controller configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Payload memory blocks, and slots per table
    pub layout: MemoryLayout,
    /// Retry counters for every PTD
    pub counters: RetryCounters,
    /// The root port has switchable power
    pub port_power_control: bool,
}

impl Config {
    /// Defaults for the ISP1763
    pub const ISP1763: Self = Self {
        layout: MemoryLayout::ISP1763,
        counters: RetryCounters::SOFTWARE_NAK,
        port_power_control: true,
    };
}

impl Default for Config {
    /// Defaults for the ISP1760 and ISP1761
    fn default() -> Self {
        Config {
            layout: MemoryLayout::ISP1760,
            counters: RetryCounters::SOFTWARE_NAK,
            port_power_control: true,
        }
    }
}

/// Identifies a URB owned by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UrbId {
    index: u8,
    generation: u16,
}

/// A request to clear a hub's transaction translator buffer
///
/// The USB core sends the Clear-TT-Buffer request to the hub, then calls
/// [`clear_tt_buffer_complete()`](Controller::clear_tt_buffer_complete).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtClearRequest {
    /// The device, and the hub that owns its TT
    pub device: Device,
    /// The endpoint whose transaction failed
    pub endpoint: EndpointKey,
    /// The endpoint's transfer type
    pub kind: EndpointType,
}

struct UrbEntry<B> {
    urb: Urb<B>,
    generation: u16,
    qh: usize,
    /// A short bulk packet retired the rest of the URB
    short: bool,
}

/// A host controller
///
/// `C` talks to the chip. `B` is the URB transfer buffer.
pub struct Controller<C, B> {
    chip: C,
    config: Config,
    pool: Pool,
    atl: SlotTable,
    int: SlotTable,
    qhs: [Option<Qh>; MAX_QHS],
    qtds: [Option<qtd::Qtd>; MAX_QTDS],
    urbs: [Option<UrbEntry<B>>; MAX_URBS],
    generation: u16,
    completed: heapless::Deque<(UrbId, Urb<B>), MAX_URBS>,
    tt_requests: heapless::Deque<TtClearRequest, MAX_TT_REQUESTS>,
    hub: RootHub,
}

impl<C: ChipAccess, B: AsRef<[u8]> + AsMut<[u8]>> Controller<C, B> {
    /// Create a controller
    ///
    /// Assumes the chip is out of reset, and its bus interface is configured.
    /// Call [`start()`](Controller::start) before submitting work.
    ///
    /// Returns [`Error::InvalidArgument`] if the memory layout doesn't
    /// [validate](crate::MemoryLayout::validate).
    pub fn new(chip: C, config: Config) -> Result<Self, Error> {
        let slots = config.layout.slots;
        Ok(Controller {
            chip,
            pool: Pool::new(&config.layout)?,
            atl: SlotTable::new(slots),
            int: SlotTable::new(slots),
            qhs: core::array::from_fn(|_| None),
            qtds: [None; MAX_QTDS],
            urbs: core::array::from_fn(|_| None),
            generation: 0,
            completed: heapless::Deque::new(),
            tt_requests: heapless::Deque::new(),
            hub: RootHub::new(config.port_power_control),
            config,
        })
    }

    pub fn chip(&self) -> &C {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the schedule
    ///
    /// Clears every PTD, skips every slot, and enables the completion
    /// interrupts. Silicon reset and PHY bring-up are the caller's job.
    pub fn start(&mut self) {
        let zeros = [0; PTD_SIZE];
        let slots = self.config.layout.slots.clamp(1, MAX_SLOTS);
        for slot in 0..slots {
            self.chip
                .write_mem(ISO_PTD_OFFSET + (slot * PTD_SIZE) as u32, &zeros);
            self.chip.write_mem(Table::Int.ptd_address(slot), &zeros);
            self.chip.write_mem(Table::Atl.ptd_address(slot), &zeros);
        }

        let last = 1 << (slots - 1);
        self.chip.write_reg(Table::Atl.last_ptd(), last);
        self.chip.write_reg(Table::Int.last_ptd(), last);
        self.chip.write_reg(Reg::IsoLastPtd, 1);
        self.chip.write_reg(Reg::AtlSkipMap, ALL_SLOTS);
        self.chip.write_reg(Reg::IntSkipMap, ALL_SLOTS);
        self.chip.write_reg(Reg::IsoSkipMap, ALL_SLOTS);
        self.atl.clear();
        self.int.clear();

        self.chip.write_reg(Reg::AtlIrqMaskAnd, 0);
        self.chip.write_reg(Reg::IntIrqMaskAnd, 0);
        self.chip.write_reg(Reg::AtlIrqMaskOr, ALL_SLOTS);
        self.chip.write_reg(Reg::IntIrqMaskOr, ALL_SLOTS);
        self.chip.write_reg(
            Reg::BufferStatus,
            (BufferStatus::ATL_FILLED | BufferStatus::INT_FILLED).bits(),
        );

        let stale = self.chip.read_reg(Reg::Interrupt);
        self.chip.write_reg(Reg::Interrupt, stale);
        self.chip.write_reg(
            Reg::InterruptEnable,
            (Interrupts::INT | Interrupts::ATL | Interrupts::EOT).bits(),
        );
        debug!("START {=usize} SLOTS", slots);
    }

    /// Submit a URB
    ///
    /// On failure, the URB comes back with the error. On success, the URB
    /// will show up in [`pop_completed()`](Controller::pop_completed), with
    /// the returned ID, once it finishes.
    pub fn enqueue(&mut self, mut urb: Urb<B>) -> Result<UrbId, (Error, Urb<B>)> {
        let pipe = *urb.pipe();
        let Some(queue) = QueueKind::of(pipe.kind) else {
            warn!("Isochronous transfers are unsupported");
            return Err((Error::Unsupported, urb));
        };
        if urb.length() > urb.buffer().as_ref().len() {
            return Err((Error::InvalidArgument, urb));
        }
        urb.actual_length = 0;
        urb.status = Ok(());

        let Some(urb_idx) = self.urbs.iter().position(Option::is_none) else {
            return Err((Error::NoMemory, urb));
        };
        let chain = match qtd::packetize(&urb, urb_idx, self.config.layout.max_chunk()) {
            Ok(chain) => chain,
            Err(error) => return Err((error, urb)),
        };
        if self.qtds.iter().filter(|qtd| qtd.is_none()).count() < chain.len() {
            return Err((Error::NoMemory, urb));
        }

        let key = pipe.key();
        let qh_idx = match self.find_qh(key) {
            Some(qh_idx) => qh_idx,
            None => match self.qhs.iter().position(Option::is_none) {
                Some(qh_idx) => {
                    self.qhs[qh_idx] = Some(Qh::new(key, queue));
                    qh_idx
                }
                None => return Err((Error::NoMemory, urb)),
            },
        };
        let Some(qh) = self.qhs[qh_idx].as_mut() else {
            return Err((Error::NoMemory, urb));
        };
        if !qh.has_room(chain.len()) {
            return Err((Error::NoMemory, urb));
        }

        for qtd in chain {
            let Some(qtd_idx) = self.qtds.iter().position(Option::is_none) else {
                break;
            };
            self.qtds[qtd_idx] = Some(qtd);
            // Capacity checked above
            let _ = qh.qtds.push_back(qtd_idx as u8);
        }

        self.generation = self.generation.wrapping_add(1);
        let id = UrbId {
            index: urb_idx as u8,
            generation: self.generation,
        };
        self.urbs[urb_idx] = Some(UrbEntry {
            urb,
            generation: self.generation,
            qh: qh_idx,
            short: false,
        });
        trace!(
            "ENQUEUE URB {=usize} EP{=u8} DEV {=u8}",
            urb_idx,
            pipe.endpoint(),
            pipe.device.address
        );

        self.schedule_ptds();
        Ok(id)
    }

    /// Cancel a URB
    ///
    /// If the URB is on the bus, its slot is reclaimed without waiting for the
    /// chip. The URB completes with `status` during this call.
    pub fn dequeue(&mut self, id: UrbId, status: Error) -> Result<(), Error> {
        let urb_idx = id.index as usize;
        let qh_idx = match self.urbs.get(urb_idx).and_then(Option::as_ref) {
            Some(entry) if entry.generation == id.generation => entry.qh,
            _ => return Err(Error::NotQueued),
        };

        let owned = |qtd_idx: &u8| {
            self.qtds[*qtd_idx as usize].map_or(false, |qtd| qtd.urb == urb_idx)
        };
        let run = self.qhs[qh_idx].as_ref().and_then(|qh| {
            let first = qh.qtds.iter().position(owned)?;
            let len = qh.qtds.iter().skip(first).take_while(|&idx| owned(idx)).count();
            Some((first, len))
        });
        if let Some(entry) = self.urbs[urb_idx].as_mut() {
            entry.urb.status = Err(status);
        }
        match run {
            Some((first, len)) => {
                // Harvesting starts at the front. Put the URB there, so it
                // doesn't wait behind URBs that are still running.
                if let Some(qh) = self.qhs[qh_idx].as_mut() {
                    qh.move_to_front(first, len);
                }
                self.dequeue_urb_from(qh_idx, 0);
            }
            None => self.urb_done(urb_idx),
        }
        debug!("DEQUEUE URB {=usize}", urb_idx);

        self.schedule_ptds();
        Ok(())
    }

    /// Drop all work for an endpoint
    ///
    /// Queued URBs complete with [`Error::Cancelled`]. The endpoint's state,
    /// including its data toggle, is forgotten.
    pub fn endpoint_disable(&mut self, key: EndpointKey) {
        let Some(qh_idx) = self.find_qh(key) else {
            return;
        };

        let len = self.qhs[qh_idx].as_ref().map_or(0, |qh| qh.qtds.len());
        for position in 0..len {
            let Some(qtd) = self.qtd_at(qh_idx, position) else {
                continue;
            };
            if qtd.status != QtdStatus::Retire {
                self.dequeue_urb_from(qh_idx, position);
                if let Some(entry) = self.urbs[qtd.urb].as_mut() {
                    entry.urb.status = Err(Error::Cancelled);
                }
            }
        }

        if let Some(qh) = self.qhs[qh_idx].as_mut() {
            qh.detached = true;
        }
        debug!("DISABLE EP{=usize} DEV {=u8}", key.address.index(), key.device);
        self.schedule_ptds();
    }

    /// Handle the host controller interrupt
    ///
    /// Returns `false` if the chip had nothing pending.
    pub fn interrupt(&mut self) -> bool {
        let pending = self.chip.read_reg(Reg::Interrupt);
        if pending == 0 {
            return false;
        }
        self.chip.write_reg(Reg::Interrupt, pending);

        let int_done = self.chip.read_reg(Reg::IntDoneMap);
        self.int.done.absorb(int_done);
        let atl_done = self.chip.read_reg(Reg::AtlDoneMap);
        self.atl.done.absorb(atl_done);
        trace!(
            "IRQ {=u32:X} INT {=u32:X} ATL {=u32:X}",
            pending,
            int_done,
            atl_done
        );

        self.handle_done_ptds();
        true
    }

    /// Find ATL slots that lost their done bit
    ///
    /// Some ISP176x silicon finishes an ATL PTD without setting its done bit.
    /// Call this every [`SLOT_CHECK_PERIOD_MS`].
    ///
    /// A slot's age counts from the first tick that sees it occupied, so no
    /// slot is inspected before it's been on the bus for 300 ms.
    pub fn tick(&mut self, now_ms: u32) {
        self.atl.mark_seen(now_ms);

        let suspects = self
            .atl
            .occupied()
            .filter(|(_, owner)| {
                owner
                    .seen
                    .map_or(false, |seen| now_ms.wrapping_sub(seen) > SLOT_TIMEOUT_MS)
            })
            .fold(0u32, |suspects, (slot, _)| suspects | 1 << slot);

        let mut stale = 0u32;
        for slot in 0..MAX_SLOTS {
            if suspects & (1 << slot) != 0 {
                let ptd = self.read_ptd(Table::Atl, slot);
                if !ptd.valid && !ptd.active {
                    stale |= 1 << slot;
                }
            }
        }

        if stale != 0 {
            warn!("ATL slots {=u32:X} finished without a done bit", stale);
            self.atl.done.absorb(stale);
        }
        if !self.atl.done.is_empty() {
            self.handle_done_ptds();
        }
    }

    /// Take the next finished URB
    pub fn pop_completed(&mut self) -> Option<(UrbId, Urb<B>)> {
        self.completed.pop_front()
    }

    /// Take the next Clear-TT-Buffer request for the USB core
    pub fn take_tt_clear_request(&mut self) -> Option<TtClearRequest> {
        self.tt_requests.pop_front()
    }

    /// The hub cleared the TT buffer for `key`; resume the endpoint
    pub fn clear_tt_buffer_complete(&mut self, key: EndpointKey) {
        for qh in self.qhs.iter_mut().flatten() {
            if qh.key == key {
                qh.tt_buffer_dirty = false;
            }
        }
        self.schedule_ptds();
    }

    /// Returns the current frame number
    pub fn frame_number(&mut self) -> u32 {
        (self.chip.read_reg(Reg::FrIndex) >> 3) % PERIODIC_SIZE
    }

    /// Handle a root hub class request
    ///
    /// See [`RootHub::control`].
    pub fn hub_control(
        &mut self,
        request: &Request,
        buf: &mut [u8],
        now_ms: u32,
    ) -> Result<usize, Error> {
        self.hub.control(&mut self.chip, request, buf, now_ms)
    }

    /// Returns the root hub's port change bitmap
    pub fn hub_status_data(&mut self, now_ms: u32) -> u8 {
        self.hub.status_data(&mut self.chip, now_ms)
    }

    /// Run one scheduler pass
    ///
    /// This runs after every interrupt and submission, so you only need it
    /// when polling.
    pub fn schedule_ptds(&mut self) {
        for qh_idx in 0..MAX_QHS {
            if self.qhs[qh_idx].is_none() {
                continue;
            }
            self.collect_qtds(qh_idx);
            let drained = self.qhs[qh_idx]
                .as_ref()
                .map_or(false, |qh| qh.detached && qh.qtds.is_empty());
            if drained {
                self.qhs[qh_idx] = None;
            }
        }

        for queue in QueueKind::ALL {
            for qh_idx in 0..MAX_QHS {
                let pending = self.qhs[qh_idx]
                    .as_ref()
                    .map_or(false, |qh| qh.queue == queue && !qh.qtds.is_empty());
                if pending {
                    self.enqueue_qtds(qh_idx);
                }
            }
        }
    }

    fn slots_mut(&mut self, table: Table) -> &mut SlotTable {
        match table {
            Table::Atl => &mut self.atl,
            Table::Int => &mut self.int,
        }
    }

    fn slots(&self, table: Table) -> &SlotTable {
        match table {
            Table::Atl => &self.atl,
            Table::Int => &self.int,
        }
    }

    fn find_qh(&self, key: EndpointKey) -> Option<usize> {
        self.qhs.iter().position(|qh| {
            qh.as_ref()
                .map_or(false, |qh| qh.key == key && !qh.detached)
        })
    }

    fn qtd_at(&self, qh_idx: usize, position: usize) -> Option<qtd::Qtd> {
        let qh = self.qhs[qh_idx].as_ref()?;
        let qtd_idx = *qh.qtds.iter().nth(position)?;
        self.qtds[qtd_idx as usize]
    }

    /// Indicates if `qtd_idx` is the last QTD of its URB
    fn is_last_qtd(&self, qh_idx: usize, qtd_idx: usize) -> bool {
        let Some(urb_idx) = self.qtds[qtd_idx].map(|qtd| qtd.urb) else {
            return true;
        };
        self.next_qtd(qh_idx, qtd_idx)
            .and_then(|next| self.qtds[next])
            .map_or(true, |next| next.urb != urb_idx)
    }

    fn next_qtd(&self, qh_idx: usize, qtd_idx: usize) -> Option<usize> {
        self.qhs[qh_idx].as_ref()?.next_after(qtd_idx)
    }

    fn set_qtd_status(&mut self, qtd_idx: usize, status: QtdStatus) {
        if let Some(qtd) = self.qtds[qtd_idx].as_mut() {
            qtd.status = status;
        }
    }

    fn read_ptd(&mut self, table: Table, slot: usize) -> Ptd {
        let mut bytes = [0; PTD_SIZE];
        self.chip.read_mem(table.ptd_address(slot), &mut bytes);
        Ptd::from_bytes(&bytes)
    }

    /// Write DW1 through DW7, then DW0, which holds the valid bit
    fn write_ptd(&mut self, table: Table, slot: usize, ptd: &Ptd) {
        let addr = table.ptd_address(slot);
        let bytes = ptd.to_bytes();
        self.chip.write_mem(addr + 4, &bytes[4..]);
        self.chip.write_mem(addr, &bytes[..4]);
    }

    fn create_ptd(&self, qh_idx: usize, qtd_idx: usize) -> Option<Ptd> {
        let qh = self.qhs[qh_idx].as_ref()?;
        let qtd = self.qtds[qtd_idx].as_ref()?;
        let pipe = self.urbs[qtd.urb].as_ref()?.urb.pipe();
        let last = self.is_last_qtd(qh_idx, qtd_idx);
        let counters = &self.config.counters;
        Some(match qh.queue {
            QueueKind::Interrupt => ptd::create_int(qtd, pipe, qh.toggle, qh.ping, last, counters),
            _ => ptd::create_atl(qtd, pipe, qh.toggle, qh.ping, last, counters),
        })
    }

    /// Copy SETUP and OUT data into the QTD's payload block
    fn write_payload(&mut self, qtd_idx: usize) {
        let Some(qtd) = self.qtds[qtd_idx] else {
            return;
        };
        if qtd.length == 0 || qtd.packet_type == PacketType::In {
            return;
        }
        let Some(entry) = self.urbs[qtd.urb].as_ref() else {
            return;
        };
        let data = match qtd.data {
            DataRef::Setup => &entry.urb.setup()[..],
            DataRef::Buffer(offset) => &entry.urb.buffer().as_ref()[offset..offset + qtd.length],
            DataRef::Empty => &[],
        };
        self.chip.write_mem(qtd.payload_addr, data);
    }

    /// Give the QH's next QTDs memory, and put the first one on the bus
    fn enqueue_qtds(&mut self, qh_idx: usize) {
        let Some(qh) = self.qhs[qh_idx].as_ref() else {
            return;
        };
        if qh.tt_buffer_dirty {
            return;
        }
        let table = qh.queue.table();

        let mut depth = 0;
        for qtd_idx in qh.qtds_from(0) {
            let Some(qtd) = self.qtds[qtd_idx].as_mut() else {
                break;
            };

            if qtd.status == QtdStatus::Enqueued {
                self.pool.allocate(qtd);
                if qtd.length > 0 && qtd.payload_addr == 0 {
                    // Out of payload memory; try again after something
                    // completes.
                    break;
                }
                qtd.status = QtdStatus::PayloadAlloc;
                self.write_payload(qtd_idx);
            }

            let status = self.qtds[qtd_idx].map(|qtd| qtd.status);
            let has_slot = self.qhs[qh_idx].as_ref().map_or(true, |qh| qh.slot.is_some());
            if status == Some(QtdStatus::PayloadAlloc) && !has_slot {
                if let Some(slot) = self.slots(table).first_free() {
                    if let Some(ptd) = self.create_ptd(qh_idx, qtd_idx) {
                        self.start_bus_transfer(table, slot, qh_idx, qtd_idx, &ptd);
                    }
                }
            }

            depth += 1;
            if depth >= ENQUEUE_DEPTH {
                break;
            }
        }
    }

    /// Place a PTD into a slot
    fn start_bus_transfer(
        &mut self,
        table: Table,
        slot: usize,
        qh_idx: usize,
        qtd_idx: usize,
        ptd: &Ptd,
    ) {
        debug_assert!(self.slots(table).get(slot).is_none(), "Slot is busy");
        debug_assert_eq!(
            self.qtds[qtd_idx].map(|qtd| qtd.status),
            Some(QtdStatus::PayloadAlloc)
        );

        self.chip.before_dispatch();
        let skip_map = table.skip_map();
        let skip = self.chip.read_reg(skip_map) | 1 << slot;
        self.chip.write_reg(skip_map, skip);

        // Don't let the previous occupant's done bit complete this PTD.
        let done = self.chip.read_reg(table.done_map());
        let slots = self.slots_mut(table);
        slots.done.absorb(done);
        slots.done.forget(slot);
        slots.occupy(
            slot,
            Slot {
                qh: qh_idx,
                qtd: qtd_idx,
                seen: None,
            },
        );
        self.set_qtd_status(qtd_idx, QtdStatus::XferStarted);
        if let Some(qh) = self.qhs[qh_idx].as_mut() {
            qh.slot = Some(slot);
        }

        self.write_ptd(table, slot, ptd);
        self.chip.write_reg(skip_map, skip & !(1 << slot));
        trace!("START SLOT {=usize} QTD {=usize} LEN {=u16}", slot, qtd_idx, ptd.length);
    }

    /// Revoke the QH's slot, without waiting for the chip
    fn kill_transfer(&mut self, qh_idx: usize) {
        let Some(qh) = self.qhs[qh_idx].as_mut() else {
            return;
        };
        let Some(slot) = qh.slot.take() else {
            return;
        };
        let table = qh.queue.table();

        let skip_map = table.skip_map();
        let skip = self.chip.read_reg(skip_map);
        self.chip.write_reg(skip_map, skip | 1 << slot);
        self.chip.after_skip();

        let slots = self.slots_mut(table);
        slots.release(slot);
        slots.done.forget(slot);
        debug!("KILL SLOT {=usize}", slot);
    }

    /// Retire the URB that owns the QTD at `position`, starting there
    fn dequeue_urb_from(&mut self, qh_idx: usize, position: usize) {
        let Some(qh) = self.qhs[qh_idx].as_ref() else {
            return;
        };
        let qtds = qh.qtds_from(position);
        let Some(urb_idx) = qtds
            .first()
            .and_then(|&qtd_idx| self.qtds[qtd_idx])
            .map(|qtd| qtd.urb)
        else {
            return;
        };

        let mut urb_was_running = false;
        for qtd_idx in qtds {
            let Some(qtd) = self.qtds[qtd_idx] else {
                break;
            };
            if qtd.urb != urb_idx {
                break;
            }
            if qtd.status >= QtdStatus::XferStarted {
                urb_was_running = true;
            }
            if qtd.status >= QtdStatus::XferComplete && self.is_last_qtd(qh_idx, qtd_idx) {
                urb_was_running = false;
            }
            if qtd.status == QtdStatus::XferStarted {
                self.kill_transfer(qh_idx);
            }
            self.set_qtd_status(qtd_idx, QtdStatus::Retire);
        }

        let split = self.urbs[urb_idx]
            .as_ref()
            .map_or(false, |entry| entry.urb.pipe().device.needs_split());
        if split && urb_was_running {
            self.request_tt_clear(qh_idx, urb_idx);
        }
    }

    /// Flag the QH's TT buffer dirty, and ask the USB core to clear it
    fn request_tt_clear(&mut self, qh_idx: usize, urb_idx: usize) {
        let Some(pipe) = self.urbs[urb_idx].as_ref().map(|entry| *entry.urb.pipe()) else {
            return;
        };
        let request = TtClearRequest {
            device: pipe.device,
            endpoint: pipe.key(),
            kind: pipe.kind,
        };
        if self.tt_requests.push_back(request).is_err() {
            // Keep going, and hope the TT recovers on its own.
            warn!("Dropped a Clear-TT-Buffer request");
            return;
        }
        if let Some(qh) = self.qhs[qh_idx].as_mut() {
            qh.tt_buffer_dirty = true;
        }
    }

    /// Move a URB to the giveback queue
    fn urb_done(&mut self, urb_idx: usize) {
        let Some(entry) = self.urbs[urb_idx].take() else {
            return;
        };
        let id = UrbId {
            index: urb_idx as u8,
            generation: entry.generation,
        };
        trace!("URB DONE {=usize} LEN {=usize}", urb_idx, entry.urb.actual_length);
        if self.completed.push_back((id, entry.urb)).is_err() {
            warn!("Giveback queue overflow");
            debug_assert!(false, "Giveback queue overflow");
        }
    }

    /// Indicates if the finished QTD is a short bulk transfer
    fn is_short_bulk(&self, qtd_idx: usize) -> bool {
        let Some(qtd) = self.qtds[qtd_idx] else {
            return false;
        };
        let bulk = self.urbs[qtd.urb]
            .as_ref()
            .map_or(false, |entry| entry.urb.pipe().kind == EndpointType::Bulk);
        bulk && qtd.actual_length < qtd.length
    }

    /// Harvest the QH's finished QTDs, oldest first
    fn collect_qtds(&mut self, qh_idx: usize) {
        loop {
            let Some(qtd_idx) = self.qhs[qh_idx]
                .as_ref()
                .and_then(|qh| qh.qtds.front())
                .map(|&qtd_idx| qtd_idx as usize)
            else {
                return;
            };
            let Some(qtd) = self.qtds[qtd_idx] else {
                warn!("QH {=usize} names a free QTD", qh_idx);
                self.pop_qtd(qh_idx);
                continue;
            };
            if qtd.status < QtdStatus::XferComplete {
                return;
            }

            let last = self.is_last_qtd(qh_idx, qtd_idx);
            if last && self.completed.is_full() {
                // Try again on the next pass.
                return;
            }
            let next = self.next_qtd(qh_idx, qtd_idx);
            if !last && qtd.status == QtdStatus::Retire {
                if let Some(next) = next {
                    self.set_qtd_status(next, QtdStatus::Retire);
                }
            }

            if qtd.status == QtdStatus::XferComplete {
                self.harvest_data(qtd_idx);
                if self.is_short_bulk(qtd_idx) {
                    if let Some(entry) = self.urbs[qtd.urb].as_mut() {
                        if entry.urb.flags().contains(UrbFlags::SHORT_NOT_OK) {
                            entry.urb.status = Err(Error::RemoteIo);
                        }
                        entry.short = !last;
                    }
                    if let (false, Some(next)) = (last, next) {
                        self.set_qtd_status(next, QtdStatus::Retire);
                    }
                }
            }

            if let Some(qtd) = self.qtds[qtd_idx].as_mut() {
                self.pool.free(qtd);
            }

            if last {
                if let Some(entry) = self.urbs[qtd.urb].as_mut() {
                    if qtd.status == QtdStatus::Retire && entry.urb.status.is_ok() && !entry.short {
                        entry.urb.status = Err(Error::Stall);
                    }
                }
                self.urb_done(qtd.urb);
            }

            self.pop_qtd(qh_idx);
            self.qtds[qtd_idx] = None;
        }
    }

    fn pop_qtd(&mut self, qh_idx: usize) {
        if let Some(qh) = self.qhs[qh_idx].as_mut() {
            qh.qtds.pop_front();
        }
    }

    /// Copy IN data out of chip memory, and account for the transferred bytes
    fn harvest_data(&mut self, qtd_idx: usize) {
        let Some(qtd) = self.qtds[qtd_idx] else {
            return;
        };
        if qtd.actual_length == 0 {
            return;
        }
        let Some(entry) = self.urbs[qtd.urb].as_mut() else {
            return;
        };

        match qtd.packet_type {
            PacketType::In => {
                let actual = qtd.actual_length.min(qtd.length);
                if let DataRef::Buffer(offset) = qtd.data {
                    let buffer = entry.urb.buffer_mut().as_mut();
                    let end = (offset + actual).min(buffer.len());
                    self.chip.read_mem(qtd.payload_addr, &mut buffer[offset..end]);
                }
                entry.urb.actual_length += actual;
            }
            PacketType::Out => entry.urb.actual_length += qtd.actual_length,
            PacketType::Setup => {}
        }
    }

    /// Handle every slot the chip reported as done
    fn handle_done_ptds(&mut self) {
        let skip = self.chip.read_reg(Reg::IntSkipMap);
        self.int.done.retain(!skip);
        let skip = self.chip.read_reg(Reg::AtlSkipMap);
        self.atl.done.retain(!skip);

        let modified = !self.int.done.is_empty() || !self.atl.done.is_empty();

        loop {
            let (table, slot) = if let Some(slot) = self.int.done.pop() {
                (Table::Int, slot)
            } else if let Some(slot) = self.atl.done.pop() {
                (Table::Atl, slot)
            } else {
                break;
            };

            let Some(owner) = self.slots_mut(table).release(slot) else {
                warn!("Done bit for empty slot {=usize}", slot);
                continue;
            };
            let (qh_idx, qtd_idx) = (owner.qh, owner.qtd);

            let mut ptd = self.read_ptd(table, slot);
            let state = match table {
                Table::Atl => ptd::check_atl(&ptd),
                Table::Int => ptd::check_int(&ptd),
            };
            if let Some(qh) = self.qhs[qh_idx].as_mut() {
                qh.slot = None;
            }

            let Some(qtd) = self.qtds[qtd_idx] else {
                warn!("Slot {=usize} names a free QTD", slot);
                continue;
            };
            debug_assert_eq!(qtd.status, QtdStatus::XferStarted);
            let Some(pipe) = self.urbs[qtd.urb].as_ref().map(|entry| *entry.urb.pipe()) else {
                continue;
            };

            let mut next = None;
            match state {
                PtdState::Done => {
                    let split_interrupt =
                        pipe.kind == EndpointType::Interrupt && pipe.device.needs_split();
                    if let Some(qtd) = self.qtds[qtd_idx].as_mut() {
                        qtd.actual_length = ptd.transferred_bytes(split_interrupt);
                        qtd.status = QtdStatus::XferComplete;
                    }
                    if !self.is_short_bulk(qtd_idx) {
                        next = self.next_qtd(qh_idx, qtd_idx);
                    }
                    if let Some(qh) = self.qhs[qh_idx].as_mut() {
                        qh.toggle = ptd.toggle;
                        qh.ping = ptd.ping;
                    }
                }
                PtdState::Reload => {
                    self.set_qtd_status(qtd_idx, QtdStatus::PayloadAlloc);
                    ptd.rearm(&self.config.counters);
                    if let Some(qh) = self.qhs[qh_idx].as_mut() {
                        qh.toggle = ptd.toggle;
                        qh.ping = ptd.ping;
                    }
                    next = Some(qtd_idx);
                }
                PtdState::Retire(error) => {
                    debug!("RETIRE SLOT {=usize} ERRNO {=i32}", slot, error.errno());
                    self.set_qtd_status(qtd_idx, QtdStatus::Retire);
                    if let Some(entry) = self.urbs[qtd.urb].as_mut() {
                        entry.urb.status = Err(error);
                    }
                    if pipe.device.needs_split() && !matches!(error, Error::Stall | Error::RemoteIo)
                    {
                        self.request_tt_clear(qh_idx, qtd.urb);
                    }
                    if let Some(qh) = self.qhs[qh_idx].as_mut() {
                        qh.reset_sequence();
                    }
                }
            }

            let Some(next) = next else {
                continue;
            };
            if self.qtds[next].map(|qtd| qtd.status) != Some(QtdStatus::PayloadAlloc) {
                continue;
            }
            if state != PtdState::Reload {
                match self.create_ptd(qh_idx, next) {
                    Some(fresh) => ptd = fresh,
                    None => continue,
                }
            }
            self.start_bus_transfer(table, slot, qh_idx, next, &ptd);
        }

        if modified {
            self.schedule_ptds();
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;
    use std::{vec, vec::Vec};

    use super::{Config, Controller, UrbId};
    use crate::{
        memory::{BlockGroup, MemoryLayout},
        qtd::QtdStatus,
        ral::{BufferStatus, Interrupts, Reg},
        sim::{Event, SimChip},
        slots::Table,
        urb::{Device, Pipe, Speed, TtLocation, Urb, UrbFlags},
        Error,
    };
    use usb_device::{
        endpoint::{
            EndpointAddress, EndpointType, IsochronousSynchronizationType, IsochronousUsageType,
        },
        UsbDirection,
    };

    type Hc = Controller<SimChip, Vec<u8>>;

    /// ISP1760 memory, without the 8 KiB blocks
    const SMALL_BLOCKS: MemoryLayout = MemoryLayout {
        groups: [
            BlockGroup {
                count: 32,
                size: 256,
            },
            BlockGroup {
                count: 20,
                size: 1024,
            },
            BlockGroup {
                count: 0,
                size: 8192,
            },
        ],
        slots: 32,
        payload_area_size: 0xffff,
    };

    const TT: TtLocation = TtLocation {
        hub_address: 2,
        port: 3,
    };

    fn controller_with(config: Config) -> Hc {
        let mut hc = Controller::new(SimChip::new(), config).unwrap();
        hc.start();
        hc
    }

    fn controller() -> Hc {
        controller_with(Config::default())
    }

    fn bulk(device: Device, endpoint: usize, direction: UsbDirection) -> Pipe {
        Pipe::new(
            device,
            EndpointAddress::from_parts(endpoint, direction),
            EndpointType::Bulk,
            512,
        )
    }

    fn control(direction: UsbDirection) -> Pipe {
        Pipe::new(
            Device::high_speed(1),
            EndpointAddress::from_parts(0, direction),
            EndpointType::Control,
            64,
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|idx| idx as u8).collect()
    }

    /// Slot ownership agrees between the tables, QHs, and QTDs
    fn check_invariants(hc: &Hc) {
        for (kind, table) in [(Table::Atl, &hc.atl), (Table::Int, &hc.int)] {
            let mut owners = Vec::new();
            for (slot, owner) in table.occupied() {
                let qh = hc.qhs[owner.qh].as_ref().unwrap();
                assert_eq!(qh.slot, Some(slot));
                assert_eq!(qh.queue.table(), kind);
                assert_eq!(hc.qtds[owner.qtd].unwrap().status, QtdStatus::XferStarted);
                assert!(!owners.contains(&owner.qh), "QH in two slots");
                owners.push(owner.qh);
            }
        }
        for (qh_idx, qh) in hc.qhs.iter().enumerate() {
            let Some(qh) = qh else { continue };
            if let Some(slot) = qh.slot {
                let owner = hc.slots(qh.queue.table()).get(slot).unwrap();
                assert_eq!(owner.qh, qh_idx);
            }
            let started = qh
                .qtds
                .iter()
                .filter(|&&qtd| hc.qtds[qtd as usize].unwrap().status == QtdStatus::XferStarted)
                .count();
            assert!(started <= 1);
        }
    }

    fn complete_urb(hc: &mut Hc) -> (UrbId, Urb<Vec<u8>>) {
        hc.pop_completed().expect("No completed URB")
    }

    #[test]
    fn start_programs_the_schedule() {
        let hc = controller();
        let chip = hc.chip();
        assert_eq!(chip.reg(Reg::AtlSkipMap), 0xffff_ffff);
        assert_eq!(chip.reg(Reg::IntSkipMap), 0xffff_ffff);
        assert_eq!(chip.reg(Reg::AtlLastPtd), 1 << 31);
        assert_eq!(chip.reg(Reg::IntLastPtd), 1 << 31);
        assert_eq!(chip.reg(Reg::AtlIrqMaskOr), 0xffff_ffff);
        assert_eq!(chip.reg(Reg::AtlIrqMaskAnd), 0);
        assert_eq!(
            chip.reg(Reg::BufferStatus),
            (BufferStatus::ATL_FILLED | BufferStatus::INT_FILLED).bits()
        );
        assert_eq!(
            chip.reg(Reg::InterruptEnable),
            (Interrupts::INT | Interrupts::ATL | Interrupts::EOT).bits()
        );

        let hc = controller_with(Config::ISP1763);
        assert_eq!(hc.chip().reg(Reg::AtlLastPtd), 1 << 15);
    }

    #[test]
    fn bulk_out_in_two_chunks() {
        let mut hc = controller_with(Config {
            layout: SMALL_BLOCKS,
            ..Config::default()
        });
        let free_blocks = hc.pool.free_blocks();
        let data = pattern(1500);
        let pipe = bulk(Device::high_speed(4), 1, UsbDirection::Out);
        let id = hc.enqueue(Urb::new(pipe, data.clone())).unwrap();
        check_invariants(&hc);

        // Both QTDs own memory, only the first is on the bus
        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert!(hc.chip().is_armed(Table::Atl, 0));
        assert_eq!(ptd.length, 1024);
        assert_eq!(ptd.device_address, 4);
        assert_eq!(hc.chip().mem(ptd.payload_address(), 1024), &data[..1024]);
        assert_eq!(hc.pool.free_blocks(), free_blocks - 2);
        assert!(hc.atl.get(1).is_none());

        hc.chip_mut().complete(Table::Atl, 0, 1024);
        assert!(hc.interrupt());
        check_invariants(&hc);
        assert!(hc.pop_completed().is_none());

        // The second QTD reuses the slot
        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert!(hc.chip().is_armed(Table::Atl, 0));
        assert_eq!(ptd.length, 476);
        assert_eq!(hc.chip().mem(ptd.payload_address(), 476), &data[1024..]);

        hc.chip_mut().complete(Table::Atl, 0, 476);
        assert!(hc.interrupt());
        check_invariants(&hc);

        let (done, urb) = complete_urb(&mut hc);
        assert_eq!(done, id);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 1500);
        assert_eq!(hc.pool.free_blocks(), free_blocks);
        assert_eq!(hc.atl.len(), 0);
        assert!(!hc.interrupt());
    }

    #[test]
    fn control_without_data_stage() {
        let mut hc = controller();
        let setup = [0x00, 0x05, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00];
        let urb = Urb::new(control(UsbDirection::Out), Vec::new()).with_setup(setup);
        hc.enqueue(urb).unwrap();

        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert_eq!(ptd.token, crate::qtd::PacketType::Setup);
        assert_eq!(ptd.length, 8);
        assert!(!ptd.toggle);
        assert_eq!(hc.chip().mem(ptd.payload_address(), 8), &setup);

        hc.chip_mut().complete(Table::Atl, 0, 8);
        hc.interrupt();
        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert_eq!(ptd.token, crate::qtd::PacketType::In);
        assert_eq!(ptd.length, 0);
        assert!(ptd.toggle);

        hc.chip_mut().complete(Table::Atl, 0, 0);
        hc.interrupt();
        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 0);
        check_invariants(&hc);
    }

    #[test]
    fn control_in_reads_descriptor() {
        let mut hc = controller();
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0x00];
        let urb = Urb::new(control(UsbDirection::In), vec![0; 18]).with_setup(setup);
        hc.enqueue(urb).unwrap();

        hc.chip_mut().complete(Table::Atl, 0, 8);
        hc.interrupt();
        let descriptor = pattern(18);
        hc.chip_mut().complete_in(Table::Atl, 0, &descriptor);
        hc.interrupt();

        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert_eq!(ptd.token, crate::qtd::PacketType::Out);
        assert!(ptd.toggle);
        hc.chip_mut().complete(Table::Atl, 0, 0);
        hc.interrupt();

        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 18);
        assert_eq!(urb.buffer(), &descriptor);
    }

    #[test]
    fn low_speed_interrupt_in() {
        let mut hc = controller();
        let device = Device::behind_hub(5, Speed::Low, TT);
        let pipe = Pipe::new(
            device,
            EndpointAddress::from_parts(1, UsbDirection::In),
            EndpointType::Interrupt,
            8,
        )
        .with_interval(10);
        hc.enqueue(Urb::new(pipe, vec![0; 8])).unwrap();
        check_invariants(&hc);
        assert_eq!(hc.atl.len(), 0);

        let ptd = hc.chip().ptd(Table::Int, 0);
        assert!(ptd.split);
        assert!(ptd.low_speed);
        assert_eq!(ptd.hub, 2);
        assert_eq!(ptd.port, 3);
        assert_eq!(ptd.complete_split, 0xff);
        assert_eq!(ptd.microframes, 0x0f);

        hc.chip_mut().complete_in(Table::Int, 0, &[1, 2, 3, 4]);
        hc.interrupt();
        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 4);
        assert_eq!(&urb.buffer()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_bulk_in() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 2, UsbDirection::In);
        hc.enqueue(Urb::new(pipe, vec![0; 512])).unwrap();
        hc.chip_mut().complete_in(Table::Atl, 0, &[0xAB; 300]);
        hc.interrupt();

        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 300);
        assert_eq!(hc.atl.len(), 0);
    }

    #[test]
    fn short_bulk_retires_remaining_chunks() {
        let mut hc = controller();
        let free_blocks = hc.pool.free_blocks();
        let pipe = bulk(Device::high_speed(2), 2, UsbDirection::In);
        hc.enqueue(Urb::new(pipe, vec![0; 10000])).unwrap();
        let dispatches = hc.chip().dispatches;

        hc.chip_mut().complete_in(Table::Atl, 0, &[0xCD; 300]);
        hc.interrupt();
        check_invariants(&hc);

        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 300);
        assert!(urb.buffer()[..300].iter().all(|&b| b == 0xCD));
        assert_eq!(hc.chip().dispatches, dispatches);
        assert_eq!(hc.pool.free_blocks(), free_blocks);
        assert!(hc.qtds.iter().all(Option::is_none));
    }

    #[test]
    fn short_not_ok() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 2, UsbDirection::In);
        let urb = Urb::new(pipe, vec![0; 512]).with_flags(UrbFlags::SHORT_NOT_OK);
        hc.enqueue(urb).unwrap();
        hc.chip_mut().complete_in(Table::Atl, 0, &[0; 100]);
        hc.interrupt();

        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Err(Error::RemoteIo));
        assert_eq!(urb.actual_length(), 100);
    }

    #[test]
    fn naks_reload_until_done() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(512))).unwrap();

        for _ in 0..5 {
            hc.chip_mut().nak(Table::Atl, 0);
            hc.interrupt();
            check_invariants(&hc);
            assert!(hc.pop_completed().is_none());

            let ptd = hc.chip().ptd(Table::Atl, 0);
            assert!(hc.chip().is_armed(Table::Atl, 0));
            assert!(ptd.active);
            assert_eq!(ptd.cerr, 3);
            assert_eq!(ptd.nak_count, 0);
        }

        hc.chip_mut().complete(Table::Atl, 0, 512);
        hc.interrupt();
        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 512);
    }

    #[test]
    fn transaction_error_reloads() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();

        hc.chip_mut().transaction_error(Table::Atl, 0);
        hc.interrupt();
        let ptd = hc.chip().ptd(Table::Atl, 0);
        assert!(hc.chip().is_armed(Table::Atl, 0));
        assert_eq!(ptd.cerr, 3);
        assert!(hc.pop_completed().is_none());

        hc.chip_mut().complete(Table::Atl, 0, 64);
        hc.interrupt();
        assert_eq!(complete_urb(&mut hc).1.status(), Ok(()));
    }

    #[test]
    fn halt_classification() {
        for (cerr, babble, expected) in [
            (3, false, Error::Stall),
            (0, false, Error::Protocol),
            (3, true, Error::Overflow),
        ] {
            let mut hc = controller();
            let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
            hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
            hc.chip_mut().halt(Table::Atl, 0, |ptd| {
                ptd.cerr = cerr;
                ptd.babble = babble;
            });
            hc.interrupt();
            assert_eq!(complete_urb(&mut hc).1.status(), Err(expected));
        }
    }

    #[test]
    fn stall_retires_the_chain() {
        let mut hc = controller_with(Config {
            layout: SMALL_BLOCKS,
            ..Config::default()
        });
        let free_blocks = hc.pool.free_blocks();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(3000))).unwrap();

        // First chunk goes through, and flips the toggle
        hc.chip_mut().complete(Table::Atl, 0, 1024);
        hc.interrupt();
        let dispatches = hc.chip().dispatches;

        hc.chip_mut().halt(Table::Atl, 0, |ptd| ptd.cerr = 3);
        hc.interrupt();
        check_invariants(&hc);

        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Err(Error::Stall));
        assert_eq!(urb.actual_length(), 1024);
        assert_eq!(hc.chip().dispatches, dispatches);
        assert_eq!(hc.pool.free_blocks(), free_blocks);
        assert_eq!(hc.atl.len(), 0);

        // The endpoint restarts from DATA0
        let qh = hc.qhs.iter().flatten().next().unwrap();
        assert!(!qh.toggle);
        assert!(qh.qtds.is_empty());
        assert!(hc.take_tt_clear_request().is_none());
    }

    #[test]
    fn split_failure_waits_for_tt_clear() {
        let mut hc = controller();
        let device = Device::behind_hub(7, Speed::Full, TT);
        let pipe = bulk(device, 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
        hc.chip_mut().halt(Table::Atl, 0, |ptd| ptd.cerr = 0);
        hc.interrupt();
        assert_eq!(complete_urb(&mut hc).1.status(), Err(Error::Protocol));

        let request = hc.take_tt_clear_request().unwrap();
        assert_eq!(request.device, device);
        assert_eq!(request.endpoint, pipe.key());
        assert_eq!(request.kind, EndpointType::Bulk);

        // The endpoint is blocked until the TT is clear
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
        assert_eq!(hc.atl.len(), 0);
        hc.clear_tt_buffer_complete(pipe.key());
        assert_eq!(hc.atl.len(), 1);
        check_invariants(&hc);
    }

    #[test]
    fn split_stall_needs_no_tt_clear() {
        let mut hc = controller();
        let pipe = bulk(Device::behind_hub(7, Speed::Full, TT), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
        hc.chip_mut().halt(Table::Atl, 0, |ptd| ptd.cerr = 2);
        hc.interrupt();
        assert_eq!(complete_urb(&mut hc).1.status(), Err(Error::Stall));
        assert!(hc.take_tt_clear_request().is_none());
    }

    #[test]
    fn dequeue_reclaims_the_slot() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::In);
        let id = hc.enqueue(Urb::new(pipe, vec![0; 512])).unwrap();
        assert!(hc.chip().is_armed(Table::Atl, 0));

        hc.dequeue(id, Error::Cancelled).unwrap();
        assert_eq!(hc.chip().reg(Reg::AtlSkipMap) & 1, 1);
        assert_eq!(hc.atl.len(), 0);
        let (done, urb) = complete_urb(&mut hc);
        assert_eq!(done, id);
        assert_eq!(urb.status(), Err(Error::Cancelled));
        assert_eq!(hc.dequeue(id, Error::Cancelled), Err(Error::NotQueued));

        // A late done bit for the skipped slot is ignored
        hc.chip_mut().raise_done(Table::Atl, 0);
        assert!(hc.interrupt());
        assert!(hc.pop_completed().is_none());
        check_invariants(&hc);
        assert!(hc.take_tt_clear_request().is_none());
    }

    #[test]
    fn dequeue_urb_waiting_behind_another() {
        let mut hc = controller();
        let pipe = Pipe::new(
            Device::high_speed(2),
            EndpointAddress::from_parts(1, UsbDirection::In),
            EndpointType::Interrupt,
            8,
        )
        .with_interval(1);
        let first = hc.enqueue(Urb::new(pipe, vec![0; 8])).unwrap();
        let second = hc.enqueue(Urb::new(pipe, vec![0; 8])).unwrap();
        check_invariants(&hc);
        let free_blocks = hc.pool.free_blocks();

        hc.dequeue(second, Error::Cancelled).unwrap();
        let (done, urb) = complete_urb(&mut hc);
        assert_eq!(done, second);
        assert_eq!(urb.status(), Err(Error::Cancelled));
        assert_eq!(hc.pool.free_blocks(), free_blocks + 1);
        assert_eq!(hc.int.len(), 1);
        check_invariants(&hc);

        // The running URB is untouched
        hc.chip_mut().complete_in(Table::Int, 0, &[1, 2]);
        hc.interrupt();
        let (done, urb) = complete_urb(&mut hc);
        assert_eq!(done, first);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 2);
        assert_eq!(hc.pool.free_blocks(), free_blocks + 2);
        assert!(hc.qtds.iter().all(Option::is_none));
        check_invariants(&hc);
    }

    #[test]
    fn dequeue_running_split_dirties_tt() {
        let mut hc = controller();
        let pipe = bulk(Device::behind_hub(7, Speed::Full, TT), 1, UsbDirection::In);
        let id = hc.enqueue(Urb::new(pipe, vec![0; 64])).unwrap();
        hc.dequeue(id, Error::CancelTimeout).unwrap();
        assert_eq!(complete_urb(&mut hc).1.status(), Err(Error::CancelTimeout));
        assert!(hc.take_tt_clear_request().is_some());
    }

    #[test]
    fn urbs_on_one_endpoint_run_in_order() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        let first = hc.enqueue(Urb::new(pipe, pattern(512))).unwrap();
        let second = hc.enqueue(Urb::new(pipe, pattern(512))).unwrap();
        check_invariants(&hc);
        assert_eq!(hc.atl.len(), 1);
        assert!(!hc.chip().ptd(Table::Atl, 0).toggle);

        hc.chip_mut().complete(Table::Atl, 0, 512);
        hc.interrupt();
        check_invariants(&hc);

        // The toggle carries over to the next URB
        assert!(hc.chip().is_armed(Table::Atl, 0));
        assert!(hc.chip().ptd(Table::Atl, 0).toggle);
        assert_eq!(complete_urb(&mut hc).0, first);

        hc.chip_mut().complete(Table::Atl, 0, 512);
        hc.interrupt();
        assert_eq!(complete_urb(&mut hc).0, second);
    }

    #[test]
    fn pool_exhaustion_is_backpressure() {
        let mut hc = controller_with(Config::ISP1763);
        let device = Device::high_speed(3);
        for endpoint in 1..=5 {
            let pipe = bulk(device, endpoint, UsbDirection::Out);
            hc.enqueue(Urb::new(pipe, pattern(4096))).unwrap();
        }
        check_invariants(&hc);
        assert_eq!(hc.atl.len(), 4);
        let waiting = hc.qtds.iter().flatten().filter(|qtd| qtd.status == QtdStatus::Enqueued);
        assert_eq!(waiting.count(), 1);

        hc.chip_mut().complete(Table::Atl, 0, 4096);
        hc.interrupt();
        check_invariants(&hc);
        assert_eq!(hc.atl.len(), 4);
        assert_eq!(hc.chip().ptd(Table::Atl, 0).endpoint, 5);
        assert_eq!(complete_urb(&mut hc).1.status(), Ok(()));
    }

    #[test]
    fn bulk_larger_than_sixteen_blocks() {
        let mut hc = controller_with(Config::ISP1763);
        let free_blocks = hc.pool.free_blocks();
        let data = pattern(16 * 4096 + 1024);
        let pipe = bulk(Device::high_speed(3), 1, UsbDirection::Out);
        let id = hc.enqueue(Urb::new(pipe, data)).unwrap();

        for chunk in 0..17 {
            check_invariants(&hc);
            let ptd = hc.chip().ptd(Table::Atl, 0);
            let expected = if chunk < 16 { 4096 } else { 1024 };
            assert_eq!(ptd.length as usize, expected);
            hc.chip_mut().complete(Table::Atl, 0, expected);
            hc.interrupt();
        }

        let (done, urb) = complete_urb(&mut hc);
        assert_eq!(done, id);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 16 * 4096 + 1024);
        assert_eq!(hc.pool.free_blocks(), free_blocks);
        assert_eq!(hc.atl.len(), 0);
    }

    #[test]
    fn invalid_layout_is_rejected() {
        let mut layout = MemoryLayout::ISP1760;
        layout.groups[2].size = 0x8000;
        layout.payload_area_size = 0x1_0000;
        let config = Config {
            layout,
            ..Config::default()
        };
        let hc: Result<Hc, Error> = Controller::new(SimChip::new(), config);
        assert!(matches!(hc, Err(Error::InvalidArgument)));
    }

    #[test]
    fn stale_slot_is_found_by_tick() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
        hc.chip_mut().finish_silently(Table::Atl, 0, 64);

        hc.tick(1000);
        assert!(hc.pop_completed().is_none());
        hc.tick(1200);
        assert!(hc.pop_completed().is_none());
        hc.tick(1301);
        let (_, urb) = complete_urb(&mut hc);
        assert_eq!(urb.status(), Ok(()));
        assert_eq!(urb.actual_length(), 64);
    }

    #[test]
    fn tick_ignores_busy_slots() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(64))).unwrap();
        hc.tick(1000);
        assert!(hc.pop_completed().is_none());
        assert!(hc.chip().is_armed(Table::Atl, 0));
    }

    #[test]
    fn endpoint_disable_cancels_and_frees() {
        let mut hc = controller();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::In);
        hc.enqueue(Urb::new(pipe, vec![0; 64])).unwrap();
        hc.enqueue(Urb::new(pipe, vec![0; 64])).unwrap();

        hc.endpoint_disable(pipe.key());
        assert_eq!(complete_urb(&mut hc).1.status(), Err(Error::Cancelled));
        assert_eq!(complete_urb(&mut hc).1.status(), Err(Error::Cancelled));
        assert!(hc.qhs.iter().all(Option::is_none));
        assert_eq!(hc.atl.len(), 0);
    }

    #[test]
    fn dispatch_arms_valid_bit_last() {
        let mut hc = controller();
        hc.chip_mut().events.clear();
        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        hc.enqueue(Urb::new(pipe, pattern(8))).unwrap();

        let events = &hc.chip().events;
        let find = |event: Event| events.iter().position(|e| *e == event).unwrap();
        let skip = find(Event::WriteReg(Reg::AtlSkipMap, 0xffff_ffff));
        let body = find(Event::WriteMem(0x0c04, 28));
        let head = find(Event::WriteMem(0x0c00, 4));
        let unskip = find(Event::WriteReg(Reg::AtlSkipMap, 0xffff_fffe));
        assert!(skip < body);
        assert!(body < head);
        assert!(head < unskip);
        assert_eq!(hc.chip().dispatches, 1);
    }

    #[test]
    fn rejected_urbs_come_back() {
        let mut hc = controller();
        let pipe = Pipe::new(
            Device::high_speed(2),
            EndpointAddress::from_parts(3, UsbDirection::In),
            EndpointType::Isochronous {
                synchronization: IsochronousSynchronizationType::NoSynchronization,
                usage: IsochronousUsageType::Data,
            },
            512,
        );
        let (error, urb) = hc.enqueue(Urb::new(pipe, vec![0; 64])).unwrap_err();
        assert_eq!(error, Error::Unsupported);
        assert_eq!(urb.buffer().len(), 64);

        let pipe = bulk(Device::high_speed(2), 1, UsbDirection::Out);
        let (error, _) = hc
            .enqueue(Urb::new(pipe, vec![0; 64]).with_length(65))
            .unwrap_err();
        assert_eq!(error, Error::InvalidArgument);
        assert!(hc.qhs.iter().all(Option::is_none));
    }

    #[test]
    fn frame_number() {
        let mut hc = controller();
        hc.chip_mut().set_reg(Reg::FrIndex, 0x1234);
        assert_eq!(hc.frame_number(), 0x1234 >> 3);
        hc.chip_mut().set_reg(Reg::FrIndex, 0x3fff);
        assert_eq!(hc.frame_number(), 0x7ff % 1024);
    }
}
