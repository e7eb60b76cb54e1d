//! Endpoint Queue Head (QH)
//!
//! One QH per active endpoint. It owns the endpoint's QTDs, in FIFO order, and
//! carries the state that survives between transactions: data toggle, ping,
//! the slot it holds, and whether its transaction translator needs a clear.

use crate::{slots::Table, urb::EndpointKey};
use usb_device::endpoint::EndpointType;

/// Most QTDs that a single QH can hold
pub const QH_DEPTH: usize = 64;

/// Which dispatch queue a QH lives on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Control,
    Bulk,
    Interrupt,
}

impl QueueKind {
    /// Dispatch order
    pub const ALL: [QueueKind; 3] = [QueueKind::Control, QueueKind::Bulk, QueueKind::Interrupt];

    /// Returns `None` for isochronous endpoints
    pub fn of(kind: EndpointType) -> Option<Self> {
        match kind {
            EndpointType::Control => Some(QueueKind::Control),
            EndpointType::Bulk => Some(QueueKind::Bulk),
            EndpointType::Interrupt => Some(QueueKind::Interrupt),
            EndpointType::Isochronous { .. } => None,
        }
    }

    /// The slot table that carries this queue's transfers
    pub fn table(self) -> Table {
        match self {
            QueueKind::Interrupt => Table::Int,
            _ => Table::Atl,
        }
    }
}

/// Endpoint queue head
pub struct Qh {
    pub(crate) key: EndpointKey,
    pub(crate) queue: QueueKind,
    pub(crate) toggle: bool,
    pub(crate) ping: bool,
    /// The slot holding this QH's started QTD
    pub(crate) slot: Option<usize>,
    /// Set while a Clear-TT-Buffer request is outstanding
    pub(crate) tt_buffer_dirty: bool,
    /// Set once the endpoint is disabled; freed when `qtds` drains
    pub(crate) detached: bool,
    /// QTD indices, oldest first
    pub(crate) qtds: heapless::Deque<u8, QH_DEPTH>,
}

impl Qh {
    /// Create a new QH, with toggle and ping cleared
    pub const fn new(key: EndpointKey, queue: QueueKind) -> Self {
        Qh {
            key,
            queue,
            toggle: false,
            ping: false,
            slot: None,
            tt_buffer_dirty: false,
            detached: false,
            qtds: heapless::Deque::new(),
        }
    }

    /// Returns the QTD that follows `qtd` in this QH
    pub fn next_after(&self, qtd: usize) -> Option<usize> {
        let mut qtds = self.qtds.iter().map(|&idx| idx as usize);
        qtds.by_ref().find(|&idx| idx == qtd)?;
        qtds.next()
    }

    /// Move the `len` QTDs starting at `position` to the front, keeping
    /// their order, and the order of everything else
    pub fn move_to_front(&mut self, position: usize, len: usize) {
        if position == 0 {
            return;
        }
        let qtds = self.qtds_from(0);
        let end = (position + len).min(qtds.len());
        self.qtds.clear();
        for &idx in qtds[position..end]
            .iter()
            .chain(&qtds[..position])
            .chain(&qtds[end..])
        {
            // Same number of entries as before
            let _ = self.qtds.push_back(idx as u8);
        }
    }

    /// Indicates if the QH has room for `count` more QTDs
    pub fn has_room(&self, count: usize) -> bool {
        QH_DEPTH - self.qtds.len() >= count
    }

    /// Copy out QTD indices, starting at `position`
    pub fn qtds_from(&self, position: usize) -> heapless::Vec<usize, QH_DEPTH> {
        self.qtds
            .iter()
            .skip(position)
            .map(|&idx| idx as usize)
            .collect()
    }

    /// Reset the data toggle and ping state
    ///
    /// Called after a transaction fails; the endpoint restarts from DATA0.
    pub fn reset_sequence(&mut self) {
        self.toggle = false;
        self.ping = false;
    }
}
