//! Physical memory for user pages.
//!
//! The [`UserPool`] hands out page frames; the [`FrameTable`] records which
//! user page each allocated frame backs and evicts frames when the pool runs
//! dry.

pub mod frame_table;
pub mod user_pool;

pub use frame_table::{Frame, FrameId, FrameInfo, FrameTable, FrameTableGuard};
pub use user_pool::UserPool;

use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The contents of one page frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Page([u8; PAGE_FRAME_SIZE]);

impl Page {
    /// Copies `src` to the start of the page and zeroes the rest.
    ///
    /// # Panics
    ///
    /// Panics if `src` is longer than a page.
    pub fn fill_from(&mut self, src: &[u8]) {
        let (head, tail) = self.0.split_at_mut(src.len());
        head.copy_from_slice(src);
        tail.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_from_zeroes_tail() {
        let mut page = Page::new_box_zeroed();
        page.as_bytes_mut().fill(0xff);
        page.fill_from(&[1, 2, 3]);
        assert_eq!(&page.as_bytes()[..3], &[1, 2, 3]);
        assert!(page.as_bytes()[3..].iter().all(|b| *b == 0));
    }
}
