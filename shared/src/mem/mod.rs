use crate::sizes::KB;
use core::fmt;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// A virtual address, either in user space or a kernel alias of a physical
/// frame (at or above [`OFFSET`]).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Rounds down to the start of the containing page.
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_FRAME_SIZE - 1))
    }

    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_FRAME_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn is_kernel(self) -> bool {
        self.0 >= OFFSET
    }

    /// Page number, i.e. the address divided by [`PAGE_FRAME_SIZE`].
    pub const fn page_number(self) -> usize {
        self.0 / PAGE_FRAME_SIZE
    }

    /// Returns the address `pages` pages after this one, or `None` on overflow.
    pub const fn checked_add_pages(self, pages: usize) -> Option<Self> {
        match pages.checked_mul(PAGE_FRAME_SIZE) {
            Some(bytes) => match self.0.checked_add(bytes) {
                Some(addr) => Some(Self(addr)),
                None => None,
            },
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

/// Number of pages needed to hold `bytes` bytes.
pub const fn pages_spanned(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let addr = VirtAddr::new(0x0804_8123);
        assert_eq!(addr.page_base(), VirtAddr::new(0x0804_8000));
        assert_eq!(addr.page_offset(), 0x123);
        assert!(!addr.is_page_aligned());
        assert!(addr.page_base().is_page_aligned());
        assert!(!addr.is_kernel());
        assert!(VirtAddr::new(OFFSET).is_kernel());
    }

    #[test]
    fn spanned_pages() {
        assert_eq!(pages_spanned(0), 0);
        assert_eq!(pages_spanned(1), 1);
        assert_eq!(pages_spanned(PAGE_FRAME_SIZE), 1);
        assert_eq!(pages_spanned(PAGE_FRAME_SIZE + 1), 2);
    }

    #[test]
    fn add_pages_overflow() {
        assert_eq!(
            VirtAddr::new(0x1000).checked_add_pages(2),
            Some(VirtAddr::new(0x3000))
        );
        assert_eq!(VirtAddr::new(usize::MAX - 10).checked_add_pages(1), None);
    }
}
