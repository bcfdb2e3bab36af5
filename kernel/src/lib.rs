//! Demand-paged virtual memory for KidneyOS.
//!
//! The crate owns the user frame table and its second-chance evictor, the
//! swap store, and each process's supplemental page table. Hardware page
//! tables, files and block devices are reached through the traits in
//! [`paging`], [`vfs`] and [`block`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod logging;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod vfs;
pub mod vm;

pub use config::VmConfig;
pub use error::{Result, VmError};
pub use kidneyos_shared::mem::{VirtAddr, PAGE_FRAME_SIZE};
pub use vm::{AddressSpace, Vm};
