//! The swap store: page-sized slots on a block device.
//!
//! Slot `n` occupies sectors `n * SECTORS_PER_PAGE .. (n + 1) * SECTORS_PER_PAGE`.
//! Which slots are in use is kept only in memory; swap contents do not
//! survive a reboot.

pub mod page_replacement;

use crate::block::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use crate::mem::Page;
use crate::sync::Mutex;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::bitmap::Bitmap;
use kidneyos_shared::sizes::SECTORS_PER_PAGE;
use log::{debug, trace, warn};
use zerocopy::AsBytes;

/// Index of a swap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A swap device and its slot bitmap.
///
/// The bitmap and the device have separate locks and neither is held while
/// taking the other, so a slot can be reserved while another thread is in
/// the middle of a transfer.
pub struct SwapSpace {
    device: Mutex<Block>,
    slots: Mutex<Bitmap>,
    swap_outs: AtomicUsize,
    swap_ins: AtomicUsize,
}

impl SwapSpace {
    /// Sets up swap on `device` with every slot free.
    pub fn new(device: Block) -> Self {
        if device.get_type() != BlockType::Swap {
            warn!("using {} block \"{}\" for swap", device.get_type(), device.get_name());
        }
        let slots = (device.get_size() / SECTORS_PER_PAGE) as usize;
        debug!("swap: {} slots on \"{}\"", slots, device.get_name());
        Self {
            device: Mutex::new(device),
            slots: Mutex::new(Bitmap::new(slots)),
            swap_outs: AtomicUsize::new(0),
            swap_ins: AtomicUsize::new(0),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().count_allocated()
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        let slots = self.slots.lock();
        slot.0 < slots.len() && slots.is_allocated(slot.0)
    }

    /// Number of pages written out since boot.
    pub fn swap_outs(&self) -> usize {
        self.swap_outs.load(Ordering::Relaxed)
    }

    /// Number of pages read back since boot.
    pub fn swap_ins(&self) -> usize {
        self.swap_ins.load(Ordering::Relaxed)
    }

    /// Reserves the lowest free slot without writing to it.
    pub fn allocate_slot(&self) -> Result<SwapSlot> {
        let index = self.slots.lock().scan_and_allocate();
        let Some(index) = index else {
            warn!("swap: all {} slots in use", self.capacity());
            return Err(VmError::SwapExhausted);
        };
        Ok(SwapSlot(index))
    }

    /// Writes `page` into a reserved slot.
    pub fn write_slot(&self, slot: SwapSlot, page: &Page) -> Result<()> {
        self.check_in_use(slot)?;
        let mut device = self.device.lock();
        let sectors = slot.first_sector()..;
        for (sector, chunk) in sectors.zip(page.as_bytes().chunks(BLOCK_SECTOR_SIZE)) {
            device.write(sector, chunk)?;
        }
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
        trace!("swap: wrote slot {}", slot);
        Ok(())
    }

    /// Reads a slot into `page`. The slot stays in use.
    pub fn read_slot(&self, slot: SwapSlot, page: &mut Page) -> Result<()> {
        self.check_in_use(slot)?;
        let mut device = self.device.lock();
        let sectors = slot.first_sector()..;
        for (sector, chunk) in sectors.zip(page.as_bytes_mut().chunks_mut(BLOCK_SECTOR_SIZE)) {
            device.read(sector, chunk)?;
        }
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
        trace!("swap: read slot {}", slot);
        Ok(())
    }

    /// Writes `page` to the lowest free slot.
    ///
    /// On a device error the slot is released again.
    pub fn swap_out(&self, page: &Page) -> Result<SwapSlot> {
        let slot = self.allocate_slot()?;
        if let Err(err) = self.write_slot(slot, page) {
            self.release(slot);
            return Err(err);
        }
        Ok(slot)
    }

    /// Reads a slot into `page` and frees it.
    ///
    /// On a device error the slot keeps its contents.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut Page) -> Result<()> {
        self.read_slot(slot, page)?;
        self.swap_free(slot)
    }

    /// Frees a slot without reading it.
    pub fn swap_free(&self, slot: SwapSlot) -> Result<()> {
        let mut slots = self.slots.lock();
        if slot.0 >= slots.len() || !slots.is_allocated(slot.0) {
            return Err(VmError::SlotNotInUse(slot));
        }
        slots.deallocate(slot.0);
        Ok(())
    }

    fn release(&self, slot: SwapSlot) {
        if self.swap_free(slot).is_err() {
            warn!("swap: slot {} was freed twice", slot);
        }
    }

    fn check_in_use(&self, slot: SwapSlot) -> Result<()> {
        if self.is_in_use(slot) {
            Ok(())
        } else {
            Err(VmError::SlotNotInUse(slot))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockError, BlockOp, MemDisk};
    use alloc::{boxed::Box, vec::Vec};
    use zerocopy::FromZeroes;

    fn swap_space(slots: u32) -> SwapSpace {
        let sectors = slots * SECTORS_PER_PAGE;
        let disk = Box::new(MemDisk::new(sectors));
        SwapSpace::new(Block::new("swap", BlockType::Swap, sectors, disk))
    }

    fn page_of(byte: u8) -> Box<Page> {
        let mut page = Page::new_box_zeroed();
        page.as_bytes_mut().fill(byte);
        page
    }

    /// Fails every transfer touching `bad_sector`.
    struct BadSector {
        disk: MemDisk,
        bad_sector: BlockSector,
    }

    impl BlockOp for BadSector {
        fn read(
            &mut self,
            sector: BlockSector,
            buf: &mut [u8],
        ) -> core::result::Result<(), BlockError> {
            if sector == self.bad_sector {
                return Err(BlockError::ReadError(sector));
            }
            self.disk.read(sector, buf)
        }

        fn write(
            &mut self,
            sector: BlockSector,
            buf: &[u8],
        ) -> core::result::Result<(), BlockError> {
            if sector == self.bad_sector {
                return Err(BlockError::WriteError(sector));
            }
            self.disk.write(sector, buf)
        }
    }

    #[test]
    fn slot_count_follows_device_size() {
        let sectors = 5 * SECTORS_PER_PAGE + 3;
        let disk = Box::new(MemDisk::new(sectors));
        let swap = SwapSpace::new(Block::new("swap", BlockType::Swap, sectors, disk));
        assert_eq!(swap.capacity(), 5);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn swap_round_trip() {
        let swap = swap_space(4);
        let a = swap.swap_out(&page_of(0xAA)).unwrap();
        let b = swap.swap_out(&page_of(0xBB)).unwrap();
        assert_eq!((a, b), (SwapSlot(0), SwapSlot(1)));

        let mut page = Page::new_box_zeroed();
        swap.swap_in(b, &mut page).unwrap();
        assert!(page.as_bytes().iter().all(|x| *x == 0xBB));
        assert!(!swap.is_in_use(b));
        assert!(swap.is_in_use(a));

        // Slot 1 is the lowest free one again.
        assert_eq!(swap.swap_out(&page_of(0xCC)).unwrap(), SwapSlot(1));
        swap.swap_in(a, &mut page).unwrap();
        assert!(page.as_bytes().iter().all(|x| *x == 0xAA));
        assert_eq!(swap.swap_outs(), 3);
        assert_eq!(swap.swap_ins(), 2);
    }

    #[test]
    fn read_slot_keeps_slot() {
        let swap = swap_space(1);
        let slot = swap.swap_out(&page_of(7)).unwrap();
        let mut page = Page::new_box_zeroed();
        swap.read_slot(slot, &mut page).unwrap();
        assert!(swap.is_in_use(slot));
        swap.swap_free(slot).unwrap();
        assert_eq!(swap.swap_free(slot), Err(VmError::SlotNotInUse(slot)));
        assert_eq!(swap.read_slot(slot, &mut page), Err(VmError::SlotNotInUse(slot)));
    }

    #[test]
    fn exhaustion_is_reported_and_slots_survive() {
        let swap = swap_space(3);
        let slots: Vec<_> = (0..3u8)
            .map(|i| swap.swap_out(&page_of(i + 1)).unwrap())
            .collect();

        assert_eq!(swap.swap_out(&page_of(0xFF)), Err(VmError::SwapExhausted));
        assert_eq!(swap.slots_in_use(), 3);

        let mut page = Page::new_box_zeroed();
        for (i, slot) in slots.into_iter().enumerate() {
            swap.swap_in(slot, &mut page).unwrap();
            assert!(page.as_bytes().iter().all(|x| *x == i as u8 + 1));
        }
    }

    #[test]
    fn failed_write_releases_slot() {
        let sectors = 2 * SECTORS_PER_PAGE;
        let driver = BadSector {
            disk: MemDisk::new(sectors),
            bad_sector: 3,
        };
        let swap = SwapSpace::new(Block::new("swap", BlockType::Swap, sectors, Box::new(driver)));

        assert_eq!(
            swap.swap_out(&page_of(1)),
            Err(VmError::Block(BlockError::WriteError(3)))
        );
        assert_eq!(swap.slots_in_use(), 0);
        // Slot 1 lives on good sectors.
        swap.allocate_slot().unwrap();
        assert_eq!(swap.swap_out(&page_of(2)), Ok(SwapSlot(1)));
    }
}
