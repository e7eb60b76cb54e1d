//! Chip payload memory
//!
//! The chip has a single SRAM region that holds transfer payloads. We split
//! it into fixed blocks once, at startup, and hand one block to each QTD that
//! moves data. There's no coalescing; a QTD gets the first free block that's
//! large enough.

use crate::{qtd::Qtd, slots::MAX_SLOTS, Error};

/// Chip address of the first payload byte.
pub const PAYLOAD_OFFSET: u32 = 0x1000;

/// Upper bound on the number of blocks in any layout.
pub const MAX_BLOCKS: usize = 64;

/// Largest block a PTD can describe; the length field is 15 bits.
pub const MAX_BLOCK_SIZE: usize = 0x7fff;

/// A group of equally-sized memory blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockGroup {
    /// How many blocks are in this group
    pub count: usize,
    /// The size of each block, in bytes
    pub size: usize,
}

/// How a chip's payload memory and slot tables are sized
///
/// Groups are listed smallest block first. The first-fit search walks blocks
/// in this order, so small transfers don't tie up large blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Block groups, smallest first
    pub groups: [BlockGroup; 3],
    /// Slots in each of the ATL and INT tables
    pub slots: usize,
    /// Size of the payload region, in bytes
    pub payload_area_size: u32,
}

impl MemoryLayout {
    /// ISP1760 / ISP1761: 32 slots per table, 60 KiB of payload memory
    pub const ISP1760: Self = Self {
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
                count: 4,
                size: 8192,
            },
        ],
        slots: 32,
        payload_area_size: 0xffff,
    };

    /// ISP1763: 16 slots per table, 20 KiB of payload memory
    pub const ISP1763: Self = Self {
        groups: [
            BlockGroup {
                count: 8,
                size: 256,
            },
            BlockGroup {
                count: 2,
                size: 1024,
            },
            BlockGroup {
                count: 4,
                size: 4096,
            },
        ],
        slots: 16,
        payload_area_size: 0x5000,
    };

    /// Returns the largest block size
    ///
    /// This is the largest amount of data that a single QTD can move.
    pub fn max_chunk(&self) -> usize {
        self.groups
            .iter()
            .filter(|group| group.count > 0)
            .map(|group| group.size)
            .max()
            .unwrap_or(0)
    }

    /// Check that the layout fits the chip
    ///
    /// Every block must fit in a PTD's length field, there must be at least
    /// one block, and the blocks must fit in the payload area. Slot counts
    /// range from 1 to 32.
    pub fn validate(&self) -> Result<(), Error> {
        if self.slots == 0 || self.slots > MAX_SLOTS {
            return Err(Error::InvalidArgument);
        }

        let groups = self.groups.iter().filter(|group| group.count > 0);
        let mut count = 0usize;
        let mut bytes = 0usize;
        for group in groups {
            if group.size == 0 || group.size > MAX_BLOCK_SIZE {
                return Err(Error::InvalidArgument);
            }
            count = count.saturating_add(group.count);
            bytes = bytes.saturating_add(group.count.saturating_mul(group.size));
        }

        if count == 0 || count > MAX_BLOCKS || bytes > self.payload_area_size as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// One block of payload memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Chip address of the block
    pub start: u32,
    /// Block size, in bytes
    pub size: usize,
    /// Set when no QTD owns this block
    pub free: bool,
}

/// Payload memory allocator
pub struct Pool {
    blocks: heapless::Vec<MemoryBlock, MAX_BLOCKS>,
}

impl Pool {
    /// Partition the payload region according to `layout`
    ///
    /// All blocks start out free. Fails if the layout doesn't
    /// [validate](MemoryLayout::validate).
    pub fn new(layout: &MemoryLayout) -> Result<Self, Error> {
        layout.validate().map_err(|error| {
            warn!("Invalid memory layout");
            error
        })?;

        let mut blocks = heapless::Vec::new();
        let mut start = PAYLOAD_OFFSET;
        for group in &layout.groups {
            for _ in 0..group.count {
                let block = MemoryBlock {
                    start,
                    size: group.size,
                    free: true,
                };
                blocks.push(block).map_err(|_| Error::InvalidArgument)?;
                start += group.size as u32;
            }
        }
        Ok(Pool { blocks })
    }

    /// Assign a block to `qtd`
    ///
    /// On success, `qtd` has a nonzero payload address. If there's no free block
    /// that's large enough, the payload address stays zero, and the caller should
    /// try again once other transfers complete. Zero-length QTDs never receive
    /// a block.
    pub fn allocate(&mut self, qtd: &mut Qtd) {
        debug_assert_eq!(qtd.payload_addr, 0, "QTD already owns payload memory");
        if qtd.length == 0 {
            return;
        }

        if let Some(block) = self
            .blocks
            .iter_mut()
            .find(|block| block.free && block.size >= qtd.length)
        {
            block.free = false;
            qtd.payload_addr = block.start;
        }
    }

    /// Release the block owned by `qtd`
    ///
    /// Does nothing if the QTD doesn't own memory.
    pub fn free(&mut self, qtd: &mut Qtd) {
        if qtd.payload_addr == 0 {
            return;
        }

        match self
            .blocks
            .iter_mut()
            .find(|block| block.start == qtd.payload_addr)
        {
            Some(block) => {
                debug_assert!(!block.free, "Double free of payload block");
                if block.free {
                    warn!("Double free of payload block {=u32:X}", block.start);
                }
                block.free = true;
            }
            None => {
                warn!("Invalid payload address {=u32:X}", qtd.payload_addr);
                debug_assert!(false, "Payload address doesn't name a block");
            }
        }
        qtd.payload_addr = 0;
    }

    /// Returns the number of free blocks
    #[cfg(test)]
    pub fn free_blocks(&self) -> usize {
        self.blocks.iter().filter(|block| block.free).count()
    }

    /// Returns all blocks, in search order
    #[cfg(test)]
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }
}
