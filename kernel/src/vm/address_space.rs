//! A process's address space: its supplemental page table, and the fault
//! and teardown paths that move pages between frames, swap and files.

use super::page::{Backing, FileBacking, PageEntry, SupplementalPageTable};
use super::Vm;
use crate::error::{Result, VmError};
use crate::mem::{Frame, Page};
use crate::paging::PageDirectory;
use crate::swapping::SwapSlot;
use crate::sync::{Mutex, MutexGuard};
use crate::vfs::{FileError, MappedFile};
use alloc::sync::{Arc, Weak};
use core::cmp::min;
use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};
use log::{debug, trace, warn};
use zerocopy::{AsBytes, FromZeroes};

pub struct AddressSpace {
    id: usize,
    vm: Arc<Vm>,
    pagedir: Arc<dyn PageDirectory>,
    spt: Mutex<SupplementalPageTable>,
    /// Serializes this space's faults, teardowns and installs. The evictor
    /// never takes it.
    fault_lock: Mutex<()>,
    me: Weak<AddressSpace>,
}

/// What tearing a page down involves, captured under the frame table lock.
enum Flush {
    Resident {
        frame: Frame,
        writable: bool,
        dirty: bool,
    },
    Swapped {
        slot: SwapSlot,
        dirty: bool,
    },
    Nothing,
}

impl AddressSpace {
    pub(super) fn new(vm: Arc<Vm>, id: usize, pagedir: Arc<dyn PageDirectory>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            vm,
            pagedir,
            spt: Mutex::new(SupplementalPageTable::new()),
            fault_lock: Mutex::new(()),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn page_directory(&self) -> &Arc<dyn PageDirectory> {
        &self.pagedir
    }

    pub(crate) fn weak(&self) -> Weak<AddressSpace> {
        self.me.clone()
    }

    pub(crate) fn lock_spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    /// Registers `upage` as a page of zeroes, materialized writable on first
    /// touch.
    pub fn install_zero_fill(&self, upage: VirtAddr) -> Result<()> {
        self.install(upage, Backing::ZeroFill, true)
    }

    /// Registers `upage` as loaded from a file on first touch.
    pub fn install_file(&self, upage: VirtAddr, backing: FileBacking, writable: bool) -> Result<()> {
        if backing.read_bytes + backing.zero_bytes != PAGE_FRAME_SIZE {
            return Err(VmError::BadMapping(upage));
        }
        self.install(upage, Backing::File(backing), writable)
    }

    /// Registers `upage` as held in swap slot `slot`, which must be in use.
    ///
    /// An existing entry for `upage` is repointed at the slot.
    pub fn install_swapped(&self, upage: VirtAddr, slot: SwapSlot, writable: bool) -> Result<()> {
        if !self.vm.swap().is_in_use(slot) {
            return Err(VmError::SlotNotInUse(slot));
        }
        self.install(upage, Backing::Swapped(slot), writable)
    }

    /// Gives `upage` a frame right away, filled in by `init`, and maps it.
    ///
    /// Used for pages the kernel sets up itself, such as the initial stack.
    pub fn install_resident(
        &self,
        upage: VirtAddr,
        writable: bool,
        init: impl FnOnce(&mut Page),
    ) -> Result<()> {
        Self::check_user_page(upage)?;
        let _fault = self.fault_lock.lock();
        if self.spt.lock().lookup(upage).is_some() {
            return Err(VmError::AlreadyInstalled(upage));
        }

        let frame = self.vm.frames().allocate(self, upage, writable, self.vm.swap())?;
        init(&mut *self.vm.frames().page(frame));
        if let Err(err) = self.map_frame(upage, frame, writable) {
            self.vm.frames().deallocate(frame, true);
            return Err(err);
        }
        self.spt
            .lock()
            .install(upage, Backing::Resident(frame), writable)?;
        self.vm.frames().unpin(frame);
        Ok(())
    }

    /// A copy of the entry for the page containing `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<PageEntry> {
        self.spt.lock().lookup(addr.page_base()).cloned()
    }

    /// Number of entries in the supplemental page table.
    pub fn pages(&self) -> usize {
        self.spt.lock().len()
    }

    /// Brings the page containing `addr` into a frame and maps it.
    ///
    /// A page that is already resident is left alone. On failure the entry
    /// and every frame and swap slot are as they were before the call.
    pub fn resolve_fault(&self, addr: VirtAddr) -> Result<()> {
        if addr.is_kernel() {
            return Err(VmError::InvalidAccess(addr));
        }
        let upage = addr.page_base();
        let _fault = self.fault_lock.lock();

        let (backing, writable) = {
            let spt = self.spt.lock();
            let entry = spt.lookup(upage).ok_or(VmError::InvalidAccess(addr))?;
            (entry.backing().clone(), entry.writable())
        };
        if let Backing::Resident(_) = backing {
            return Ok(());
        }
        self.vm.count_fault();

        let frame = self.vm.frames().allocate(self, upage, writable, self.vm.swap())?;
        if let Err(err) = self
            .load(frame, &backing)
            .and_then(|()| self.map_frame(upage, frame, writable))
        {
            self.vm.frames().deallocate(frame, true);
            return Err(err);
        }

        let committed = match self.spt.lock().lookup_mut(upage) {
            Some(entry) => {
                entry.set_backing(Backing::Resident(frame));
                true
            }
            None => false,
        };
        if !committed {
            // Only this space removes its entries, and we hold its fault lock.
            self.pagedir.unmap(upage);
            self.vm.frames().deallocate(frame, true);
            return Err(VmError::InvalidAccess(addr));
        }
        if let Backing::Swapped(slot) = backing {
            if self.vm.swap().swap_free(slot).is_err() {
                warn!("swap slot {slot} of {upage} freed behind our back");
            }
        }
        self.vm.frames().unpin(frame);
        trace!("space {}: {upage} resident in {}", self.id, frame.kpage());
        Ok(())
    }

    /// Flushes one page of a file mapping and forgets it.
    ///
    /// `upage` holds `bytes` bytes of `file` starting at `offset`. A resident
    /// or swapped page is written back if it was modified; a page that was
    /// never touched costs no I/O. The entry is removed unless the write
    /// back fails, in which case the page is left as it was.
    pub fn teardown_mapped_page(
        &self,
        upage: VirtAddr,
        file: &dyn MappedFile,
        offset: u64,
        bytes: usize,
    ) -> Result<()> {
        let bytes = min(bytes, PAGE_FRAME_SIZE);
        let _fault = self.fault_lock.lock();

        let flush = {
            let mut frames = self.vm.frames().lock();
            let spt = self.spt.lock();
            let Some(entry) = spt.lookup(upage) else {
                return Ok(());
            };
            match *entry.backing() {
                Backing::Resident(frame) => {
                    frames.pin(frame);
                    Flush::Resident {
                        frame,
                        writable: entry.writable(),
                        dirty: entry.dirty(),
                    }
                }
                Backing::Swapped(slot) => Flush::Swapped {
                    slot,
                    dirty: entry.dirty(),
                },
                Backing::ZeroFill | Backing::File(_) => Flush::Nothing,
            }
        };

        match flush {
            Flush::Resident {
                frame,
                writable,
                dirty,
            } => {
                let kpage = frame.kpage();
                self.pagedir.unmap(upage);
                let dirty = dirty || self.pagedir.is_dirty(upage) || self.pagedir.is_dirty(kpage);
                if dirty {
                    let page = self.vm.frames().page(frame);
                    if let Err(err) = write_all(file, offset, &page.as_bytes()[..bytes]) {
                        drop(page);
                        if self.pagedir.map(upage, kpage, writable).is_err() {
                            warn!("could not restore mapping for {upage}");
                        }
                        if let Some(entry) = self.spt.lock().lookup_mut(upage) {
                            entry.mark_dirty();
                        }
                        self.vm.frames().unpin(frame);
                        return Err(err);
                    }
                    self.vm.count_writeback();
                }
                self.pagedir.set_dirty(kpage, false);
                self.vm.frames().deallocate(frame, true);
            }
            Flush::Swapped { slot, dirty } => {
                if dirty {
                    let mut scratch = Page::new_box_zeroed();
                    self.vm.swap().read_slot(slot, &mut scratch)?;
                    write_all(file, offset, &scratch.as_bytes()[..bytes])?;
                    self.vm.count_writeback();
                }
                self.vm.swap().swap_free(slot)?;
            }
            Flush::Nothing => {}
        }

        self.spt.lock().remove(upage);
        trace!("space {}: unmapped {upage}", self.id);
        Ok(())
    }

    /// Releases every frame and swap slot this space holds and empties its
    /// page table. Calling it again does nothing.
    ///
    /// Nothing is written back; unmap file mappings first.
    pub fn destroy(&self) {
        let _fault = self.fault_lock.lock();
        let mut frames = self.vm.frames().lock();
        let mut spt = self.spt.lock();
        if spt.is_empty() {
            return;
        }

        let (mut released_frames, mut released_slots) = (0, 0);
        for entry in spt.drain() {
            match *entry.backing() {
                Backing::Resident(frame) => {
                    self.pagedir.unmap(entry.upage());
                    frames.deallocate(frame, true);
                    released_frames += 1;
                }
                Backing::Swapped(slot) => {
                    if self.vm.swap().swap_free(slot).is_err() {
                        warn!("space {}: swap slot {slot} already free", self.id);
                    }
                    released_slots += 1;
                }
                Backing::ZeroFill | Backing::File(_) => {}
            }
        }
        debug!(
            "space {} destroyed: released {released_frames} frames, {released_slots} swap slots",
            self.id
        );
    }

    /// Checks that every resident entry of this space and the frame table
    /// record behind it point at each other.
    pub fn check_consistency(&self) -> bool {
        let _fault = self.fault_lock.lock();
        let frames = self.vm.frames().lock();
        let spt = self.spt.lock();

        let entries_agree = spt.iter().all(|entry| match entry.backing().frame() {
            Some(frame) => frames
                .get(frame)
                .is_some_and(|info| info.upage == entry.upage() && info.owner_id == self.id),
            None => true,
        });
        let frames_agree = frames
            .snapshot()
            .iter()
            .filter(|info| info.owner_id == self.id)
            .all(|info| {
                spt.lookup(info.upage)
                    .and_then(|entry| entry.backing().frame())
                    == Some(info.frame)
            });
        entries_agree && frames_agree
    }

    fn install(&self, upage: VirtAddr, backing: Backing, writable: bool) -> Result<()> {
        Self::check_user_page(upage)?;
        let _fault = self.fault_lock.lock();
        self.spt.lock().install(upage, backing, writable)
    }

    fn check_user_page(upage: VirtAddr) -> Result<()> {
        if !upage.is_page_aligned() || upage.is_kernel() {
            return Err(VmError::InvalidAccess(upage));
        }
        Ok(())
    }

    /// Fills a freshly allocated frame from `backing`.
    fn load(&self, frame: Frame, backing: &Backing) -> Result<()> {
        let mut page = self.vm.frames().page(frame);
        match backing {
            Backing::ZeroFill | Backing::Resident(_) => page.as_bytes_mut().fill(0),
            Backing::Swapped(slot) => self.vm.swap().read_slot(*slot, &mut page)?,
            Backing::File(source) => {
                let read_bytes = min(source.read_bytes, PAGE_FRAME_SIZE);
                let bytes = page.as_bytes_mut();
                // A file truncated since it was mapped reads short; the
                // missing tail comes in as zeroes.
                let read = source.file.read_at(source.offset, &mut bytes[..read_bytes])?;
                bytes[read..].fill(0);
            }
        }
        Ok(())
    }

    /// Maps a loaded frame, starting with clean accessed and dirty bits.
    fn map_frame(&self, upage: VirtAddr, frame: Frame, writable: bool) -> Result<()> {
        self.pagedir.set_dirty(frame.kpage(), false);
        self.pagedir.set_accessed(frame.kpage(), false);
        self.pagedir.map(upage, frame.kpage(), writable)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn write_all(file: &dyn MappedFile, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let written = file.write_at(offset, buf)?;
        if written == 0 {
            return Err(FileError::NoSpace.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}
