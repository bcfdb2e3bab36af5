use super::{MappedFile, Result};
use crate::sync::Mutex;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An in-memory file.
///
/// Counts reads and writes so callers can check how much I/O an operation
/// caused.
#[derive(Default)]
pub struct TempFile {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl MappedFile for TempFile {
    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= data.len() {
            return Ok(0);
        }
        let len = min(buf.len(), data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let offset = usize::try_from(offset).map_err(|_| super::FileError::NoSpace)?;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_is_short_at_end_of_file() {
        let file = TempFile::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(3, &mut buf), Ok(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(file.read_at(5, &mut buf), Ok(0));
        assert_eq!(file.read_at(100, &mut buf), Ok(0));
        assert_eq!(file.reads(), 3);
    }

    #[test]
    fn write_past_end_grows_file() {
        let file = TempFile::new(vec![1, 2]);
        assert_eq!(file.write_at(4, &[9, 9]), Ok(2));
        assert_eq!(file.contents(), vec![1, 2, 0, 0, 9, 9]);
        assert_eq!(file.len(), Ok(6));
        assert_eq!(file.writes(), 1);
    }
}
