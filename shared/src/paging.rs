// https://wiki.osdev.org/Paging

// Frame addresses are 32-bit on every platform we support; the high bits of a
// wider usize are dropped when packing them into an entry.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{VirtAddr, PAGE_FRAME_SIZE};
use arbitrary_int::u20;
use bitbybit::bitfield;

const FRAME_NUMBER_MASK: u32 = (1 << 20) - 1;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user entry pointing at the frame whose kernel alias is `kpage`.
    ///
    /// Accessed and dirty start cleared, as the MMU expects for a fresh mapping.
    pub fn user_mapping(kpage: VirtAddr, writable: bool) -> Self {
        let frame_number = (kpage.as_usize() / PAGE_FRAME_SIZE) as u32 & FRAME_NUMBER_MASK;
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame_number))
    }

    /// Kernel alias address of the mapped frame.
    pub fn frame(&self) -> VirtAddr {
        VirtAddr::new(self.page_frame_address().value() as usize * PAGE_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mapping_bits() {
        let entry = PageTableEntry::user_mapping(VirtAddr::new(0xC012_3000), false);
        assert!(entry.present());
        assert!(entry.user_supervisor());
        assert!(!entry.read_write());
        assert!(!entry.accessed());
        assert!(!entry.dirty());
        assert_eq!(entry.frame(), VirtAddr::new(0xC012_3000));
    }

    #[test]
    fn clearing_present_keeps_dirty() {
        let entry = PageTableEntry::user_mapping(VirtAddr::new(0xC000_1000), true)
            .with_dirty(true)
            .with_present(false);
        assert!(entry.dirty());
        assert!(!entry.present());
    }
}
