//! The supplemental page table: where each user page of a process lives
//! when it is not (or not only) in the hardware page table.

use crate::error::{Result, VmError};
use crate::mem::Frame;
use crate::swapping::SwapSlot;
use crate::vfs::MappedFile;
use alloc::sync::Arc;
use core::fmt;
use hashbrown::HashMap;
use kidneyos_shared::mem::VirtAddr;

/// Where a file-backed page's contents come from.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn MappedFile>,
    /// Byte offset of the page in the file.
    pub offset: u64,
    /// Bytes to read from the file; the rest of the page is zeroed.
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Backing {
    /// In a frame, and mapped once the frame is unpinned.
    Resident(Frame),
    /// Not yet touched; comes in as a page of zeroes.
    ZeroFill,
    /// Evicted to swap.
    Swapped(SwapSlot),
    /// Not yet touched; comes in from a file.
    File(FileBacking),
}

impl Backing {
    pub fn frame(&self) -> Option<Frame> {
        match self {
            Backing::Resident(frame) => Some(*frame),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageEntry {
    upage: VirtAddr,
    backing: Backing,
    writable: bool,
    /// Set once the page is known to differ from its file or zero-fill
    /// source. Never cleared while the entry exists.
    dirty: bool,
}

impl PageEntry {
    pub fn upage(&self) -> VirtAddr {
        self.upage
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn set_backing(&mut self, backing: Backing) {
        self.backing = backing;
    }
}

/// One address space's page entries, keyed by page-aligned user address.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: HashMap<VirtAddr, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records how to bring `upage` in.
    ///
    /// Installing [`Backing::Swapped`] over an existing entry rewrites that
    /// entry in place, keeping its writable and dirty flags. Any other
    /// install over an existing entry fails with
    /// [`VmError::AlreadyInstalled`].
    pub fn install(&mut self, upage: VirtAddr, backing: Backing, writable: bool) -> Result<()> {
        debug_assert!(upage.is_page_aligned());
        if let Some(entry) = self.entries.get_mut(&upage) {
            return match backing {
                Backing::Swapped(_) => {
                    entry.backing = backing;
                    Ok(())
                }
                _ => Err(VmError::AlreadyInstalled(upage)),
            };
        }
        self.entries.insert(
            upage,
            PageEntry {
                upage,
                backing,
                writable,
                dirty: false,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, upage: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub(crate) fn lookup_mut(&mut self, upage: VirtAddr) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    pub(crate) fn remove(&mut self, upage: VirtAddr) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PageEntry> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::TempFile;
    use alloc::vec;

    const UPAGE: VirtAddr = VirtAddr::new(0x1000_0000);

    #[test]
    fn duplicate_install_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        spt.install(UPAGE, Backing::ZeroFill, true).unwrap();
        assert_eq!(
            spt.install(UPAGE, Backing::ZeroFill, true),
            Err(VmError::AlreadyInstalled(UPAGE))
        );
        let file = FileBacking {
            file: Arc::new(TempFile::new(vec![1; 10])),
            offset: 0,
            read_bytes: 10,
            zero_bytes: 4086,
        };
        assert_eq!(
            spt.install(UPAGE, Backing::File(file), false),
            Err(VmError::AlreadyInstalled(UPAGE))
        );
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn swapped_install_updates_in_place() {
        let mut spt = SupplementalPageTable::new();
        spt.install(UPAGE, Backing::ZeroFill, false).unwrap();
        spt.lookup_mut(UPAGE).unwrap().mark_dirty();

        spt.install(UPAGE, Backing::Swapped(SwapSlot::new(3)), true)
            .unwrap();
        let entry = spt.lookup(UPAGE).unwrap();
        assert!(matches!(entry.backing(), Backing::Swapped(slot) if slot.index() == 3));
        assert!(!entry.writable());
        assert!(entry.dirty());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn swapped_install_creates_missing_entry() {
        let mut spt = SupplementalPageTable::new();
        spt.install(UPAGE, Backing::Swapped(SwapSlot::new(0)), true)
            .unwrap();
        let entry = spt.lookup(UPAGE).unwrap();
        assert!(entry.writable());
        assert!(!entry.dirty());
        assert!(spt.remove(UPAGE).is_some());
        assert!(spt.lookup(UPAGE).is_none());
        assert!(spt.is_empty());
    }
}
