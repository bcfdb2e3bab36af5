//! The slice of the file system the VM layer needs: positional reads and
//! writes on an open file.

pub mod tempfs;

pub use tempfs::TempFile;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileError {
    /// the underlying device failed
    #[error("i/o error")]
    Io,
    /// no space left on device
    #[error("no space left on device")]
    NoSpace,
    /// the file has been closed or removed
    #[error("stale file handle")]
    Stale,
}

pub type Result<T> = core::result::Result<T, FileError>;

/// An open file that pages can be loaded from and written back to.
///
/// Offsets are absolute; implementations must not depend on a shared seek
/// position, since the VM layer reads and writes from several threads.
pub trait MappedFile: Send + Sync {
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset`, growing the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
}
