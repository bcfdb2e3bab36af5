//! Hardware address-space primitives.
//!
//! The VM core never touches page tables directly. It installs and clears
//! user mappings and reads the MMU's accessed and dirty bits through
//! [`PageDirectory`], for both a user page and the kernel alias of the frame
//! behind it.

use crate::error::{Result, VmError};
use crate::sync::Mutex;
use hashbrown::HashMap;
use kidneyos_shared::mem::VirtAddr;
use kidneyos_shared::paging::PageTableEntry;

/// One process's page directory.
///
/// Addresses passed in are page aligned. Bit queries on an address with no
/// entry return `false`, and setting a bit on one is ignored.
pub trait PageDirectory: Send + Sync {
    /// Maps user page `upage` to the frame at kernel address `kpage`.
    ///
    /// Fails if the page tables needed for the mapping cannot be allocated.
    fn map(&self, upage: VirtAddr, kpage: VirtAddr, writable: bool) -> Result<()>;

    /// Marks `upage` not present. Accessed and dirty bits are kept, so they
    /// can still be read after the mapping is gone.
    fn unmap(&self, upage: VirtAddr);

    fn is_accessed(&self, vaddr: VirtAddr) -> bool;
    fn set_accessed(&self, vaddr: VirtAddr, accessed: bool);
    fn is_dirty(&self, vaddr: VirtAddr) -> bool;
    fn set_dirty(&self, vaddr: VirtAddr, dirty: bool);
}

/// A page directory kept in ordinary memory.
///
/// Entries use the hardware layout but no MMU ever walks them; accesses are
/// reported with [`SoftPageDirectory::simulate_access`]. Used to bring up the
/// VM layer before paging is enabled, and in tests.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<HashMap<VirtAddr, PageTableEntry>>,
    /// Most user pages that may be present at once. `None` is unbounded.
    limit: Option<usize>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory that refuses to map more than `limit` user pages, as if
    /// it had run out of page table memory.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::default(),
            limit: Some(limit),
        }
    }

    /// The kernel address `upage` is mapped to, if it is present.
    pub fn translate(&self, upage: VirtAddr) -> Option<VirtAddr> {
        let entries = self.entries.lock();
        let entry = entries.get(&upage.page_base())?;
        entry.present().then(|| entry.frame())
    }

    pub fn is_writable(&self, upage: VirtAddr) -> bool {
        let entries = self.entries.lock();
        entries
            .get(&upage.page_base())
            .is_some_and(|entry| entry.present() && entry.read_write())
    }

    /// Number of present user mappings.
    pub fn mapped_pages(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.present())
            .count()
    }

    /// Touches `vaddr` the way the MMU would on a user access.
    ///
    /// Returns `false` where the hardware would fault instead: the page is
    /// not present, or the access is a write to a read-only page.
    pub fn simulate_access(&self, vaddr: VirtAddr, write: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&vaddr.page_base()) else {
            return false;
        };
        if !entry.present() || (write && !entry.read_write()) {
            return false;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        true
    }

    fn update(&self, vaddr: VirtAddr, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&vaddr.page_base()) {
            *entry = f(*entry);
        } else if vaddr.is_kernel() {
            // Kernel aliases are always mapped; record their bits on demand.
            entries.insert(vaddr.page_base(), f(PageTableEntry::DEFAULT));
        }
    }

    fn bit(&self, vaddr: VirtAddr, f: impl FnOnce(&PageTableEntry) -> bool) -> bool {
        self.entries.lock().get(&vaddr.page_base()).is_some_and(f)
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&self, upage: VirtAddr, kpage: VirtAddr, writable: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let present = entries.values().filter(|entry| entry.present()).count();
        if self.limit.is_some_and(|limit| present >= limit) {
            return Err(VmError::MappingFailed(upage));
        }
        entries.insert(upage, PageTableEntry::user_mapping(kpage, writable));
        Ok(())
    }

    fn unmap(&self, upage: VirtAddr) {
        self.update(upage, |entry| entry.with_present(false));
    }

    fn is_accessed(&self, vaddr: VirtAddr) -> bool {
        self.bit(vaddr, |entry| entry.accessed())
    }

    fn set_accessed(&self, vaddr: VirtAddr, accessed: bool) {
        self.update(vaddr, |entry| entry.with_accessed(accessed));
    }

    fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.bit(vaddr, |entry| entry.dirty())
    }

    fn set_dirty(&self, vaddr: VirtAddr, dirty: bool) {
        self.update(vaddr, |entry| entry.with_dirty(dirty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPAGE: VirtAddr = VirtAddr::new(0x0804_8000);
    const KPAGE: VirtAddr = VirtAddr::new(0xC000_3000);

    #[test]
    fn access_sets_bits_and_unmap_keeps_them() {
        let pd = SoftPageDirectory::new();
        assert!(!pd.simulate_access(UPAGE, false));

        pd.map(UPAGE, KPAGE, true).unwrap();
        let inside = VirtAddr::new(UPAGE.as_usize() + 0x10);
        assert_eq!(pd.translate(inside), Some(KPAGE));
        assert!(pd.simulate_access(inside, true));
        assert!(pd.is_accessed(UPAGE));
        assert!(pd.is_dirty(UPAGE));

        pd.unmap(UPAGE);
        assert_eq!(pd.translate(UPAGE), None);
        assert!(pd.is_dirty(UPAGE));
        assert!(!pd.simulate_access(UPAGE, false));

        // A fresh mapping starts clean.
        pd.map(UPAGE, KPAGE, true).unwrap();
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    fn read_only_pages_refuse_writes() {
        let pd = SoftPageDirectory::new();
        pd.map(UPAGE, KPAGE, false).unwrap();
        assert!(!pd.is_writable(UPAGE));
        assert!(!pd.simulate_access(UPAGE, true));
        assert!(pd.simulate_access(UPAGE, false));
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    fn kernel_alias_bits_are_tracked() {
        let pd = SoftPageDirectory::new();
        assert!(!pd.is_dirty(KPAGE));
        pd.set_dirty(KPAGE, true);
        assert!(pd.is_dirty(KPAGE));
        // Unmapped user pages have no bits to set.
        pd.set_dirty(UPAGE, true);
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    fn limit_makes_map_fail() {
        let pd = SoftPageDirectory::with_limit(1);
        pd.map(UPAGE, KPAGE, true).unwrap();
        let next = VirtAddr::new(0x0804_9000);
        assert_eq!(pd.map(next, KPAGE, true), Err(VmError::MappingFailed(next)));
        pd.unmap(UPAGE);
        assert_eq!(pd.map(next, KPAGE, true), Ok(()));
    }
}
