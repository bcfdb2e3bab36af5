use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// Allocator for the physical frames reserved for user pages.
///
/// Frames are identified by their kernel alias address. Placement is next
/// fit: the search for a free frame resumes after the last one handed out,
/// so recently freed frames are not immediately reused.
pub struct UserPool {
    base: VirtAddr,
    core_map: Box<[CoreMapEntry]>,
    position: usize,
    frames_allocated: usize,
}

impl UserPool {
    pub fn new(base: VirtAddr, frames: usize) -> Self {
        debug_assert!(base.is_page_aligned());
        Self {
            base,
            core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            position: 0,
            frames_allocated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn frames_free(&self) -> usize {
        self.capacity() - self.frames_allocated
    }

    /// Takes a free frame, returning its kernel address.
    pub fn allocate(&mut self) -> Option<VirtAddr> {
        let total_frames = self.core_map.len();
        if self.frames_allocated == total_frames {
            return None;
        }

        let index = (0..total_frames)
            .map(|step| (self.position + step) % total_frames)
            .find(|&i| !self.core_map[i].allocated())?;

        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.position = (index + 1) % total_frames;
        self.frames_allocated += 1;
        Some(self.kpage(index))
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `kpage` is not an allocated frame of this pool.
    pub fn free(&mut self, kpage: VirtAddr) {
        let index = self
            .index_of(kpage)
            .unwrap_or_else(|| panic!("{kpage} is not a user pool frame"));
        assert!(self.core_map[index].allocated(), "double free of frame {kpage}");
        self.core_map[index] = self.core_map[index].with_allocated(false);
        self.frames_allocated -= 1;
    }

    pub fn kpage(&self, index: usize) -> VirtAddr {
        VirtAddr::new(self.base.as_usize() + index * PAGE_FRAME_SIZE)
    }

    /// Index of the frame at `kpage`, if it belongs to this pool.
    pub fn index_of(&self, kpage: VirtAddr) -> Option<usize> {
        if !kpage.is_page_aligned() {
            return None;
        }
        let index = kpage.as_usize().checked_sub(self.base.as_usize())? / PAGE_FRAME_SIZE;
        (index < self.core_map.len()).then_some(index)
    }
}
