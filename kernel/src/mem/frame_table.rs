//! The frame table: which user page each allocated frame holds.
//!
//! Records live in an arena indexed by [`FrameId`]; a map from kernel
//! address to id gives constant-time lookup by frame, and the clock hand
//! walks the arena in index order, passing over vacant slots. When the
//! [`UserPool`] is empty, [`FrameTableGuard::allocate`] evicts a frame to
//! swap and retries once.
//!
//! Eviction rewrites the victim's entry in its owner's supplemental page
//! table, so the frame table lock is always taken before any SPT lock.

use super::{Page, UserPool};
use crate::error::{Result, VmError};
use crate::paging::PageDirectory;
use crate::swapping::page_replacement::{
    PageReplacementPolicy, ReplacementCandidate, SecondChance,
};
use crate::swapping::{SwapSlot, SwapSpace};
use crate::sync::{Mutex, MutexGuard};
use crate::vm::page::Backing;
use crate::vm::AddressSpace;
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashMap;
use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};
use log::{debug, error, trace, warn};
use zerocopy::FromZeroes;

/// Stable index of a record in the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

/// Handle to an allocated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: FrameId,
    kpage: VirtAddr,
}

impl Frame {
    pub fn id(self) -> FrameId {
        self.id
    }

    /// Kernel address of the frame.
    pub fn kpage(self) -> VirtAddr {
        self.kpage
    }
}

struct FrameRecord {
    kpage: VirtAddr,
    upage: VirtAddr,
    owner: Weak<AddressSpace>,
    owner_id: usize,
    pagedir: Arc<dyn PageDirectory>,
    pinned: bool,
    writable: bool,
}

impl ReplacementCandidate for FrameRecord {
    fn pinned(&self) -> bool {
        // An owner that is being dropped frees its own frames.
        self.pinned || self.owner.strong_count() == 0
    }

    fn test_and_clear_accessed(&self) -> bool {
        let accessed =
            self.pagedir.is_accessed(self.upage) || self.pagedir.is_accessed(self.kpage);
        if accessed {
            self.pagedir.set_accessed(self.upage, false);
            self.pagedir.set_accessed(self.kpage, false);
        }
        accessed
    }
}

/// A copy of one frame table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: Frame,
    pub upage: VirtAddr,
    pub owner_id: usize,
    pub pinned: bool,
    pub writable: bool,
}

impl FrameRecord {
    fn info(&self, id: FrameId) -> FrameInfo {
        FrameInfo {
            frame: Frame {
                id,
                kpage: self.kpage,
            },
            upage: self.upage,
            owner_id: self.owner_id,
            pinned: self.pinned,
            writable: self.writable,
        }
    }
}

struct FrameTableState {
    pool: UserPool,
    frames: Vec<Option<FrameRecord>>,
    vacant: Vec<FrameId>,
    by_kpage: HashMap<VirtAddr, FrameId>,
    clock: SecondChance,
}

pub struct FrameTable {
    state: Mutex<FrameTableState>,
    base: VirtAddr,
    /// Contents of the pool's frames, in pool order.
    memory: Box<[Mutex<Page>]>,
    evictions: AtomicUsize,
}

impl FrameTable {
    /// Creates a table over `frames` user frames starting at kernel address
    /// `base`. The evictor gives up after `max_passes` clock revolutions.
    pub fn new(base: VirtAddr, frames: usize, max_passes: usize) -> Self {
        debug!("frame table: {frames} user frames at {base}");
        let memory: Vec<Mutex<Page>> = (0..frames)
            .map(|_| Mutex::new(Page::new_zeroed()))
            .collect();
        Self {
            state: Mutex::new(FrameTableState {
                pool: UserPool::new(base, frames),
                frames: Vec::with_capacity(frames),
                vacant: Vec::new(),
                by_kpage: HashMap::with_capacity(frames),
                clock: SecondChance::new(max_passes),
            }),
            base,
            memory: memory.into_boxed_slice(),
            evictions: AtomicUsize::new(0),
        }
    }

    /// Takes the frame table lock for a sequence of operations.
    pub fn lock(&self) -> FrameTableGuard<'_> {
        FrameTableGuard {
            state: self.state.lock(),
            table: self,
            deferred: Vec::new(),
        }
    }

    /// Allocates a pinned frame for `upage` of `owner`, evicting another
    /// frame if the pool is empty.
    pub fn allocate(
        &self,
        owner: &AddressSpace,
        upage: VirtAddr,
        writable: bool,
        swap: &SwapSpace,
    ) -> Result<Frame> {
        self.lock().allocate(owner, upage, writable, swap)
    }

    pub fn deallocate(&self, frame: Frame, release_physical: bool) {
        self.lock().deallocate(frame, release_physical);
    }

    pub fn pin(&self, frame: Frame) {
        self.lock().pin(frame);
    }

    pub fn unpin(&self, frame: Frame) {
        self.lock().unpin(frame);
    }

    /// Returns a frame kept by `deallocate(frame, false)` to the pool.
    pub fn free_physical(&self, kpage: VirtAddr) {
        self.state.lock().pool.free(kpage);
    }

    /// Locks the contents of `frame`.
    ///
    /// The frame table lock is not needed, but the caller must keep the frame
    /// pinned (or hold the frame table lock) so it is not evicted meanwhile.
    pub fn page(&self, frame: Frame) -> MutexGuard<'_, Page> {
        self.memory[self.memory_index(frame.kpage)].lock()
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.state.lock().by_kpage.len()
    }

    /// Number of frames evicted since boot.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Copies of every record, in arena order.
    pub fn snapshot(&self) -> Vec<FrameInfo> {
        self.lock().snapshot()
    }

    fn memory_index(&self, kpage: VirtAddr) -> usize {
        (kpage.as_usize() - self.base.as_usize()) / PAGE_FRAME_SIZE
    }
}

/// The frame table, locked.
pub struct FrameTableGuard<'a> {
    state: MutexGuard<'a, FrameTableState>,
    table: &'a FrameTable,
    // Dropped after `state`: letting go of an evicted page's owner may tear
    // that address space down, and teardown takes the frame table lock.
    deferred: Vec<Arc<AddressSpace>>,
}

impl FrameTableGuard<'_> {
    /// Allocates a frame for `upage` of `owner`.
    ///
    /// The frame comes back pinned; the caller unpins it once its contents
    /// and mapping are in place. If the pool is empty one frame is evicted
    /// first, and if that fails its error is returned.
    pub fn allocate(
        &mut self,
        owner: &AddressSpace,
        upage: VirtAddr,
        writable: bool,
        swap: &SwapSpace,
    ) -> Result<Frame> {
        let kpage = match self.state.pool.allocate() {
            Some(kpage) => kpage,
            None => {
                self.evict(swap)?;
                self.state.pool.allocate().ok_or(VmError::FrameExhausted)?
            }
        };

        let record = FrameRecord {
            kpage,
            upage,
            owner: owner.weak(),
            owner_id: owner.id(),
            pagedir: owner.page_directory().clone(),
            pinned: true,
            writable,
        };
        let state = &mut *self.state;
        let id = match state.vacant.pop() {
            Some(id) => {
                state.frames[id.0] = Some(record);
                id
            }
            None => {
                state.frames.push(Some(record));
                FrameId(state.frames.len() - 1)
            }
        };
        state.by_kpage.insert(kpage, id);
        trace!("frame {kpage} allocated for {upage} of space {}", owner.id());
        Ok(Frame { id, kpage })
    }

    /// Removes `frame` from the table. The physical page goes back to the
    /// pool if `release_physical` is set; otherwise the caller owns it until
    /// [`FrameTable::free_physical`].
    pub fn deallocate(&mut self, frame: Frame, release_physical: bool) {
        if self.remove(frame).is_none() {
            warn!("deallocating unknown frame {}", frame.kpage);
            return;
        }
        if release_physical {
            self.state.pool.free(frame.kpage);
        }
    }

    pub fn pin(&mut self, frame: Frame) {
        if let Some(record) = self.record_mut(frame) {
            record.pinned = true;
        }
    }

    pub fn unpin(&mut self, frame: Frame) {
        if let Some(record) = self.record_mut(frame) {
            record.pinned = false;
        }
    }

    pub fn get(&self, frame: Frame) -> Option<FrameInfo> {
        self.state.frames[frame.id.0]
            .as_ref()
            .filter(|record| record.kpage == frame.kpage)
            .map(|record| record.info(frame.id))
    }

    /// Looks a frame up by its kernel address.
    pub fn lookup(&self, kpage: VirtAddr) -> Option<FrameInfo> {
        let id = *self.state.by_kpage.get(&kpage)?;
        self.state.frames[id.0]
            .as_ref()
            .map(|record| record.info(id))
    }

    pub fn snapshot(&self) -> Vec<FrameInfo> {
        self.state
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, record)| Some(record.as_ref()?.info(FrameId(i))))
            .collect()
    }

    fn record_mut(&mut self, frame: Frame) -> Option<&mut FrameRecord> {
        self.state
            .frames
            .get_mut(frame.id.0)?
            .as_mut()
            .filter(|record| record.kpage == frame.kpage)
    }

    fn remove(&mut self, frame: Frame) -> Option<FrameRecord> {
        self.record_mut(frame)?;
        let state = &mut *self.state;
        let record = state.frames[frame.id.0].take()?;
        state.vacant.push(frame.id);
        state.by_kpage.remove(&record.kpage);
        Some(record)
    }

    /// Evicts one frame to swap and returns it to the pool.
    fn evict(&mut self, swap: &SwapSpace) -> Result<()> {
        let state = &mut *self.state;
        let Some(index) = state.clock.select_victim(&state.frames) else {
            warn!("no evictable frame among {} in use", state.by_kpage.len());
            return Err(VmError::FrameExhausted);
        };
        let Some(victim) = state.frames[index].as_ref() else {
            return Err(VmError::FrameExhausted);
        };
        let Some(owner) = victim.owner.upgrade() else {
            return Err(VmError::FrameExhausted);
        };
        let frame = Frame {
            id: FrameId(index),
            kpage: victim.kpage,
        };
        let (upage, writable) = (victim.upage, victim.writable);
        let result = Self::swap_out(self.table, &owner, frame, upage, writable, swap);
        self.deferred.push(owner);
        let slot = result?;

        self.remove(frame);
        self.state.pool.free(frame.kpage);
        self.table.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("evicted {upage} ({}) to swap slot {slot}", frame.kpage);
        Ok(())
    }

    /// Moves the contents of `frame` to a fresh swap slot and points its
    /// owner's page table entry there.
    ///
    /// On failure the mapping is restored and nothing else changes, except
    /// that the entry is marked dirty if the hardware said it was.
    fn swap_out(
        table: &FrameTable,
        owner: &AddressSpace,
        frame: Frame,
        upage: VirtAddr,
        writable: bool,
        swap: &SwapSpace,
    ) -> Result<SwapSlot> {
        let pagedir = owner.page_directory();
        let slot = swap.allocate_slot()?;

        pagedir.unmap(upage);
        let dirty = pagedir.is_dirty(upage) || pagedir.is_dirty(frame.kpage);

        let written = swap.write_slot(slot, &table.page(frame));
        if let Err(err) = written {
            if swap.swap_free(slot).is_err() {
                warn!("swap slot {slot} vanished during eviction");
            }
            if pagedir.map(upage, frame.kpage, writable).is_err() {
                error!("could not restore mapping for {upage} after failed eviction");
            }
            if dirty {
                if let Some(entry) = owner.lock_spt().lookup_mut(upage) {
                    entry.mark_dirty();
                }
            }
            return Err(err);
        }

        let mut spt = owner.lock_spt();
        spt.install(upage, Backing::Swapped(slot), writable)?;
        if dirty {
            if let Some(entry) = spt.lookup_mut(upage) {
                entry.mark_dirty();
            }
        }
        drop(spt);

        pagedir.set_dirty(frame.kpage, false);
        pagedir.set_accessed(frame.kpage, false);
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockType, MemDisk};
    use crate::paging::SoftPageDirectory;
    use crate::vm::Vm;
    use crate::VmConfig;
    use kidneyos_shared::sizes::SECTORS_PER_PAGE;

    fn vm(frames: usize) -> Arc<Vm> {
        let config = VmConfig {
            user_frames: frames,
            ..VmConfig::DEFAULT
        };
        let sectors = 4 * SECTORS_PER_PAGE;
        let disk = Box::new(MemDisk::new(sectors));
        Vm::new(config, Block::new("swap", BlockType::Swap, sectors, disk))
    }

    #[test]
    fn allocate_pins_and_records_owner() {
        let vm = vm(2);
        let space = vm.create_address_space(Arc::new(SoftPageDirectory::new()));
        let upage = VirtAddr::new(0x4000_0000);

        let frame = vm.frames().allocate(&space, upage, true, vm.swap()).unwrap();
        let info = vm.frames().lock().lookup(frame.kpage()).unwrap();
        assert_eq!(info.frame, frame);
        assert_eq!(info.upage, upage);
        assert_eq!(info.owner_id, space.id());
        assert!(info.pinned);

        vm.frames().unpin(frame);
        vm.frames().unpin(frame);
        assert!(!vm.frames().lock().get(frame).unwrap().pinned);
        vm.frames().pin(frame);
        assert!(vm.frames().lock().get(frame).unwrap().pinned);

        vm.frames().deallocate(frame, true);
        assert!(vm.frames().lock().get(frame).is_none());
        assert_eq!(vm.frames().frames_in_use(), 0);
    }

    #[test]
    fn kept_physical_page_is_not_reused_until_freed() {
        let vm = vm(1);
        let space = vm.create_address_space(Arc::new(SoftPageDirectory::new()));
        let upage = VirtAddr::new(0x4000_0000);

        let frame = vm.frames().allocate(&space, upage, true, vm.swap()).unwrap();
        vm.frames().deallocate(frame, false);
        // The only frame is still out of the pool and nothing is evictable.
        assert_eq!(
            vm.frames().allocate(&space, upage, true, vm.swap()),
            Err(VmError::FrameExhausted)
        );

        vm.frames().free_physical(frame.kpage());
        let again = vm.frames().allocate(&space, upage, true, vm.swap()).unwrap();
        assert_eq!(again.kpage(), frame.kpage());
        // The arena slot was recycled too.
        assert_eq!(again.id(), frame.id());
        assert_eq!(vm.frames().snapshot().len(), 1);
        vm.frames().deallocate(again, true);
    }
}
