//! Memory-mapped files.
//!
//! Mapping a file only records where each page comes from; pages are read
//! in by the fault handler. Unmapping writes modified pages back.

use super::page::FileBacking;
use super::AddressSpace;
use crate::error::{Result, VmError};
use crate::vfs::MappedFile;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::fmt;
use kidneyos_shared::mem::{pages_spanned, VirtAddr, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Identifies a mapping within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(usize);

impl MapId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct MappedRegion {
    id: MapId,
    file: Arc<dyn MappedFile>,
    base: VirtAddr,
    length: usize,
}

impl MappedRegion {
    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn file(&self) -> &Arc<dyn MappedFile> {
        &self.file
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Length of the mapped file in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn pages(&self) -> usize {
        pages_spanned(self.length)
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        let start = self.base.as_usize();
        (start..start + self.pages() * PAGE_FRAME_SIZE).contains(&addr.as_usize())
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Installs file-backed entries for all of `file` at `base`, returning the
/// file's length.
///
/// Fails with [`VmError::BadMapping`] if `base` is null or unaligned, the
/// file is empty, or the range reaches kernel space or overlaps a page that
/// already has an entry. Nothing stays installed after a failure.
pub fn map_file(
    space: &AddressSpace,
    file: &Arc<dyn MappedFile>,
    base: VirtAddr,
    writable: bool,
) -> Result<usize> {
    let bad = VmError::BadMapping(base);
    if base.as_usize() == 0 || !base.is_page_aligned() {
        return Err(bad);
    }
    let length = usize::try_from(file.len()?).map_err(|_| bad)?;
    if length == 0 {
        return Err(bad);
    }
    let pages = pages_spanned(length);
    let end = base.checked_add_pages(pages).ok_or(bad)?;
    if end.as_usize() > OFFSET {
        return Err(bad);
    }
    if (0..pages).any(|i| space.lookup(page_at(base, i)).is_some()) {
        return Err(bad);
    }

    for i in 0..pages {
        let offset = i * PAGE_FRAME_SIZE;
        let read_bytes = min(PAGE_FRAME_SIZE, length - offset);
        let backing = FileBacking {
            file: file.clone(),
            offset: offset as u64,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
        };
        if let Err(err) = space.install_file(page_at(base, i), backing, writable) {
            unmap_installed(space, file.as_ref(), base, i, length);
            return Err(match err {
                VmError::AlreadyInstalled(_) => bad,
                err => err,
            });
        }
    }
    Ok(length)
}

/// Writes back and removes every page of a mapping of `length` bytes of
/// `file` at `base`.
///
/// Stops at the first page that cannot be written back; pages before it
/// are gone, so calling this again finishes the job.
pub fn unmap_region(
    space: &AddressSpace,
    file: &dyn MappedFile,
    base: VirtAddr,
    length: usize,
) -> Result<()> {
    for i in 0..pages_spanned(length) {
        let offset = i * PAGE_FRAME_SIZE;
        let bytes = min(PAGE_FRAME_SIZE, length - offset);
        space.teardown_mapped_page(page_at(base, i), file, offset as u64, bytes)?;
    }
    Ok(())
}

/// Undoes the first `pages` installs of a mapping of `length` bytes that
/// could not be completed.
///
/// Nothing has faulted these in yet unless another thread touched them, so
/// this is usually free of I/O.
pub(super) fn unmap_installed(
    space: &AddressSpace,
    file: &dyn MappedFile,
    base: VirtAddr,
    pages: usize,
    length: usize,
) {
    for i in 0..pages {
        let offset = i * PAGE_FRAME_SIZE;
        let bytes = min(PAGE_FRAME_SIZE, length.saturating_sub(offset));
        let upage = page_at(base, i);
        if let Err(err) = space.teardown_mapped_page(upage, file, offset as u64, bytes) {
            warn!("space {}: rolling back {upage} failed: {err}", space.id());
        }
    }
}

fn page_at(base: VirtAddr, index: usize) -> VirtAddr {
    VirtAddr::new(base.as_usize() + index * PAGE_FRAME_SIZE)
}

/// A process's file mappings.
#[derive(Default)]
pub struct MmapTable {
    regions: BTreeMap<MapId, MappedRegion>,
    next_id: usize,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps all of `file` read-write at `base`.
    pub fn mmap(
        &mut self,
        space: &AddressSpace,
        file: Arc<dyn MappedFile>,
        base: VirtAddr,
    ) -> Result<MapId> {
        let length = map_file(space, &file, base, true)?;
        let id = MapId(self.next_id);
        self.next_id += 1;
        debug!("space {}: mapping {id} at {base}, {length} bytes", space.id());
        self.regions.insert(
            id,
            MappedRegion {
                id,
                file,
                base,
                length,
            },
        );
        Ok(id)
    }

    /// Writes back and removes mapping `id`.
    ///
    /// If a write back fails the mapping stays listed, and a later call
    /// picks up where this one stopped.
    pub fn munmap(&mut self, space: &AddressSpace, id: MapId) -> Result<()> {
        let region = self.regions.get(&id).ok_or(VmError::UnknownMapping(id))?;
        unmap_region(space, region.file.as_ref(), region.base, region.length)?;
        self.regions.remove(&id);
        debug!("space {}: unmapped {id}", space.id());
        Ok(())
    }

    /// Unmaps everything, as on process exit. Every mapping is attempted;
    /// the first error is returned.
    pub fn unmap_all(&mut self, space: &AddressSpace) -> Result<()> {
        let ids: Vec<MapId> = self.regions.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(err) = self.munmap(space, id) {
                result = result.and(Err(err));
            }
        }
        result
    }

    pub fn get(&self, id: MapId) -> Option<&MappedRegion> {
        self.regions.get(&id)
    }

    /// The mapping containing `addr`, if any.
    pub fn find(&self, addr: VirtAddr) -> Option<&MappedRegion> {
        self.regions.values().find(|region| region.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappedRegion> {
        self.regions.values()
    }
}
