use alloc::{vec, vec::Vec};

/// A fixed-size bitmap, one bit per slot. A set bit means "in use".
#[derive(Clone, Debug)]
pub struct Bitmap {
    bits: Vec<u8>, // Each byte represents 8 slots.
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` slots, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        assert!(index < self.len, "bitmap index {index} out of range");
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn allocate(&mut self, index: usize) {
        assert!(index < self.len, "bitmap index {index} out of range");
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn deallocate(&mut self, index: usize) {
        assert!(index < self.len, "bitmap index {index} out of range");
        self.bits[index / 8] &= !(1 << (index % 8));
    }

    /// Finds the lowest clear slot, marks it allocated and returns it.
    ///
    /// Returns `None` when every slot is in use.
    pub fn scan_and_allocate(&mut self) -> Option<usize> {
        let byte_index = self.bits.iter().position(|byte| *byte != u8::MAX)?;
        let index = byte_index * 8 + self.bits[byte_index].trailing_ones() as usize;
        // The last byte may have clear bits past the end of the map.
        if index >= self.len {
            return None;
        }
        self.allocate(index);
        Some(index)
    }

    /// Number of allocated slots.
    pub fn count_allocated(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_returns_lowest_free() {
        let mut map = Bitmap::new(20);
        assert_eq!(map.scan_and_allocate(), Some(0));
        assert_eq!(map.scan_and_allocate(), Some(1));
        map.allocate(2);
        map.allocate(3);
        map.deallocate(1);
        assert_eq!(map.scan_and_allocate(), Some(1));
        assert_eq!(map.scan_and_allocate(), Some(4));
        assert_eq!(map.count_allocated(), 5);
    }

    #[test]
    fn scan_stops_at_len() {
        // 10 slots live in two bytes; bits 10..16 of the second byte are padding.
        let mut map = Bitmap::new(10);
        for expected in 0..10 {
            assert_eq!(map.scan_and_allocate(), Some(expected));
        }
        assert_eq!(map.scan_and_allocate(), None);
        assert_eq!(map.count_allocated(), 10);
    }

    #[test]
    fn empty_map_has_no_slots() {
        let mut map = Bitmap::new(0);
        assert!(map.is_empty());
        assert_eq!(map.scan_and_allocate(), None);
    }

    #[test]
    #[should_panic]
    fn out_of_range_index_panics() {
        Bitmap::new(4).allocate(4);
    }
}
