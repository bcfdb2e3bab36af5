//! Per-process virtual memory on top of the shared frame table and swap.
//!
//! A [`Vm`] owns the system-wide state; each process gets an
//! [`AddressSpace`] holding an `Arc` to it. The kernel creates one `Vm` at
//! boot with [`init`] and finds it again with [`get`].

pub mod address_space;
pub mod mmap;
pub mod page;


pub use address_space::AddressSpace;
pub use mmap::{MapId, MappedRegion, MmapTable};
pub use page::{Backing, FileBacking, PageEntry, SupplementalPageTable};

use crate::block::Block;
use crate::config::VmConfig;
use crate::mem::FrameTable;
use crate::paging::PageDirectory;
use crate::swapping::SwapSpace;
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::VirtAddr;
use log::{info, warn};
use once_cell::race::OnceBox;

/// Counters since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Faults that brought a page into a frame.
    pub faults: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
    /// Pages written back to mapped files.
    pub writebacks: usize,
    pub frames_in_use: usize,
    pub swap_slots_in_use: usize,
}

pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapSpace,
    faults: AtomicUsize,
    writebacks: AtomicUsize,
    next_space_id: AtomicUsize,
}

impl Vm {
    /// Sets up the frame table described by `config` and swap on
    /// `swap_device`.
    pub fn new(config: VmConfig, swap_device: Block) -> Arc<Self> {
        let frames = FrameTable::new(
            VirtAddr::new(config.user_pool_base),
            config.user_frames,
            config.evict_passes,
        );
        let swap = SwapSpace::new(swap_device);
        info!(
            "vm: {} user frames, {} swap slots",
            frames.capacity(),
            swap.capacity()
        );
        Arc::new(Self {
            config,
            frames,
            swap,
            faults: AtomicUsize::new(0),
            writebacks: AtomicUsize::new(0),
            next_space_id: AtomicUsize::new(1),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Creates an empty address space using `pagedir` for its hardware
    /// mappings.
    pub fn create_address_space(
        self: &Arc<Self>,
        pagedir: Arc<dyn PageDirectory>,
    ) -> Arc<AddressSpace> {
        let id = self.next_space_id.fetch_add(1, Ordering::Relaxed);
        AddressSpace::new(self.clone(), id, pagedir)
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            faults: self.faults.load(Ordering::Relaxed),
            evictions: self.frames.evictions(),
            swap_outs: self.swap.swap_outs(),
            swap_ins: self.swap.swap_ins(),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            frames_in_use: self.frames.frames_in_use(),
            swap_slots_in_use: self.swap.slots_in_use(),
        }
    }

    fn count_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    fn count_writeback(&self) {
        self.writebacks.fetch_add(1, Ordering::Relaxed);
    }
}

static VM: OnceBox<Arc<Vm>> = OnceBox::new();

/// Creates the system's [`Vm`]. Later calls return the first one and drop
/// their arguments.
pub fn init(config: VmConfig, swap_device: Block) -> &'static Arc<Vm> {
    let mut created = false;
    let vm = VM.get_or_init(|| {
        created = true;
        Box::new(Vm::new(config, swap_device))
    });
    if !created {
        warn!("vm already initialized");
    }
    vm
}

/// The system's [`Vm`], once [`init`] has run.
pub fn get() -> Option<&'static Arc<Vm>> {
    VM.get()
}
