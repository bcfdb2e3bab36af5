use crate::block::BlockError;
use crate::swapping::SwapSlot;
use crate::vfs::FileError;
use crate::vm::mmap::MapId;
use kidneyos_shared::mem::VirtAddr;
use thiserror::Error;

/// Errors reported by the VM core.
///
/// None of these terminate the caller; turning an unresolvable fault into a
/// process exit is up to the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No user frame could be obtained, even after trying to evict one.
    #[error("no user frame available")]
    FrameExhausted,
    /// Every swap slot is in use.
    #[error("swap device is full")]
    SwapExhausted,
    /// The page has no supplemental page table entry.
    #[error("invalid access to unmapped page {0}")]
    InvalidAccess(VirtAddr),
    /// A non-swap backing was installed over an existing entry.
    #[error("page {0} already has a backing")]
    AlreadyInstalled(VirtAddr),
    /// The hardware page directory refused the mapping.
    #[error("could not install hardware mapping for {0}")]
    MappingFailed(VirtAddr),
    /// A swap slot was read or freed while not holding a page.
    #[error("swap slot {0} is not in use")]
    SlotNotInUse(SwapSlot),
    /// A file mapping request was malformed or overlaps existing pages.
    #[error("cannot map file at {0}")]
    BadMapping(VirtAddr),
    /// No mapped region has this id.
    #[error("no mapping with id {0}")]
    UnknownMapping(MapId),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    File(#[from] FileError),
}

pub type Result<T> = core::result::Result<T, VmError>;
