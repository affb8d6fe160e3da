
/// A fixed-capacity bitmap over a sliding window of indexes. Setting a bit beyond the window
///  advances the window, clearing bits that drop out at its lower end. Storage wraps around,
///  so advancing never moves data.
#[derive(Clone, Debug)]
pub struct BitArray {
    bits: Vec<u8>,
    capacity: u64,
    offset: u64,
}
impl BitArray {
    /// `capacity` is rounded up to a multiple of 8
    pub fn new(capacity: u64) -> BitArray {
        let num_bytes = capacity.max(1).div_ceil(8);
        BitArray {
            bits: vec![0; num_bytes as usize],
            capacity: num_bytes * 8,
            offset: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// lowest index inside the window
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn in_window(&self, index: u64) -> bool {
        index >= self.offset && index - self.offset < self.capacity
    }

    fn position(&self, index: u64) -> (usize, u8) {
        let p = index % self.capacity;
        ((p / 8) as usize, 0x80 >> (p % 8))
    }

    pub fn get(&self, index: u64) -> bool {
        if !self.in_window(index) {
            return false;
        }
        let (byte, mask) = self.position(index);
        self.bits[byte] & mask != 0
    }

    /// Sets or clears a single bit. Clearing a bit outside the window is a no-op, setting a bit
    ///  beyond the window advances it, and setting a bit below the window is ignored.
    pub fn set(&mut self, index: u64, value: bool) {
        if index < self.offset {
            return;
        }
        if index - self.offset >= self.capacity {
            if !value {
                return;
            }
            self.advance_to(index + 1 - self.capacity);
        }

        let (byte, mask) = self.position(index);
        if value {
            self.bits[byte] |= mask;
        }
        else {
            self.bits[byte] &= !mask;
        }
    }

    /// sets the bits for all indexes in `start..end`
    pub fn set_range(&mut self, start: u64, end: u64, value: bool) {
        // everything below the resulting window would be discarded anyway
        let start = if value && end > self.capacity {
            start.max(end - self.capacity)
        }
        else {
            start
        };
        for index in start..end {
            self.set(index, value);
        }
    }

    fn advance_to(&mut self, new_offset: u64) {
        if new_offset <= self.offset {
            return;
        }
        if new_offset - self.offset >= self.capacity {
            self.bits.fill(0);
        }
        else {
            for index in self.offset..new_offset {
                let (byte, mask) = self.position(index);
                self.bits[byte] &= !mask;
            }
        }
        self.offset = new_offset;
    }

    /// indexes of all set bits in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item=u64> + '_ {
        (self.offset..self.offset + self.capacity)
            .filter(|&index| self.get(index))
    }

    pub fn min(&self) -> Option<u64> {
        self.iter_set().next()
    }

    pub fn max(&self) -> Option<u64> {
        (self.offset..self.offset + self.capacity)
            .rev()
            .find(|&index| self.get(index))
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact(16, 16)]
    #[case::round_up(10, 16)]
    #[case::zero(0, 8)]
    fn test_capacity(#[case] requested: u64, #[case] expected: u64) {
        assert_eq!(BitArray::new(requested).capacity(), expected);
    }

    #[test]
    fn test_set_get() {
        let mut bits = BitArray::new(16);
        assert_eq!(bits.min(), None);
        assert_eq!(bits.max(), None);

        bits.set(3, true);
        bits.set(9, true);
        assert!(bits.get(3));
        assert!(!bits.get(4));
        assert_eq!(bits.min(), Some(3));
        assert_eq!(bits.max(), Some(9));

        bits.set(3, false);
        assert_eq!(bits.min(), Some(9));
    }

    #[test]
    fn test_advance_wraps_around() {
        let mut bits = BitArray::new(8);
        bits.set(1, true);
        bits.set(6, true);

        bits.set(10, true);
        assert_eq!(bits.offset(), 3);
        assert!(!bits.get(1));
        assert!(bits.get(6));
        assert!(bits.get(10));
        assert!(!bits.get(2), "index 2 shares storage with 10 but is below the window");
        assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![6, 10]);

        // far jump clears everything
        bits.set(100, true);
        assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![100]);

        // below the window
        bits.set(50, true);
        assert!(!bits.get(50));
    }

    #[test]
    fn test_clear_beyond_window_does_not_advance() {
        let mut bits = BitArray::new(8);
        bits.set(2, true);
        bits.set(20, false);
        assert_eq!(bits.offset(), 0);
        assert!(bits.get(2));
    }

    #[test]
    fn test_set_range() {
        let mut bits = BitArray::new(8);
        bits.set_range(2, 6, true);
        assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        bits.set_range(3, 5, false);
        assert_eq!(bits.iter_set().collect::<Vec<_>>(), vec![2, 5]);

        bits.set_range(0, 1000, true);
        assert_eq!(bits.offset(), 992);
        assert_eq!(bits.min(), Some(992));
        assert_eq!(bits.max(), Some(999));
    }
}
