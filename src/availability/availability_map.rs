use crate::addressing::{bin_to_chunk, bounds_of, chunk_to_bin, Address, Bin};
use crate::availability::BitArray;

/// Which chunks of a live stream are available (at a peer, or locally), over a sliding window
///  of chunks
#[derive(Clone, Debug)]
pub struct AvailabilityMap {
    chunks: BitArray,
}
impl AvailabilityMap {
    pub fn new(capacity_chunks: u64) -> AvailabilityMap {
        AvailabilityMap {
            chunks: BitArray::new(capacity_chunks),
        }
    }

    pub fn set(&mut self, address: &Address, value: bool) {
        self.chunks.set_range(address.start_chunk(), address.end_chunk() + 1, value);
    }

    /// sets all chunks in the range, returning the chunk bins that were not set before
    pub fn set_new(&mut self, address: &Address) -> Vec<Bin> {
        let start_chunk = address.start_chunk().max((address.end_chunk() + 1).saturating_sub(self.chunks.capacity()));
        let mut result = Vec::new();
        for chunk in start_chunk..=address.end_chunk() {
            if !self.chunks.get(chunk) {
                self.chunks.set(chunk, true);
                if self.chunks.get(chunk) {
                    result.push(chunk_to_bin(chunk));
                }
            }
        }
        result
    }

    /// true if all chunks covered by the bin are available
    pub fn get(&self, bin: Bin) -> bool {
        let (start, end) = bounds_of(bin);
        (bin_to_chunk(start)..=bin_to_chunk(end))
            .all(|chunk| self.chunks.get(chunk))
    }

    /// lowest available chunk bin, `None` if nothing is available
    pub fn min(&self) -> Option<Bin> {
        self.chunks.min().map(chunk_to_bin)
    }

    /// highest available chunk bin, `None` if nothing is available
    pub fn max(&self) -> Option<Bin> {
        self.chunks.max().map(chunk_to_bin)
    }

    /// indexes of all available chunks in ascending order
    pub fn to_value_array(&self) -> Vec<u64> {
        self.chunks.iter_set().collect()
    }

    /// available chunks collapsed into maximal contiguous ranges
    pub fn ranges(&self) -> Vec<Address> {
        let mut result: Vec<Address> = Vec::new();
        let mut current: Option<(Bin, Bin)> = None;
        for bin in self.chunks.iter_set().map(chunk_to_bin) {
            current = match current {
                Some((start, end)) if end + 2 == bin => Some((start, bin)),
                Some((start, end)) => {
                    result.push(Address::from_range(start, end));
                    Some((bin, bin))
                }
                None => Some((bin, bin)),
            };
        }
        if let Some((start, end)) = current {
            result.push(Address::from_range(start, end));
        }
        result
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty() {
        let map = AvailabilityMap::new(64);
        assert_eq!(map.min(), None);
        assert_eq!(map.max(), None);
        assert!(map.to_value_array().is_empty());
        assert!(!map.get(0));
    }

    #[test]
    fn test_set_range_and_get_bins() {
        let mut map = AvailabilityMap::new(64);
        map.set(&Address::from_bin(3), true);
        assert_eq!(map.to_value_array(), vec![0, 1, 2, 3]);
        assert!(map.get(3));
        assert!(map.get(5));
        assert!(!map.get(7));
        assert_eq!(map.min(), Some(0));
        assert_eq!(map.max(), Some(6));

        map.set(&Address::chunk(1), false);
        assert!(!map.get(3));
        assert!(map.get(5));
    }

    #[test]
    fn test_chunk_range_reads_back_as_chunk_indexes() {
        let mut map = AvailabilityMap::new(64);
        map.set(&Address::from_chunk_range(40, 49), true);
        assert_eq!(map.to_value_array(), (40..50).collect::<Vec<u64>>());
        assert_eq!(map.min(), Some(chunk_to_bin(40)));
        assert_eq!(map.max(), Some(chunk_to_bin(49)));
        assert!(!map.get(chunk_to_bin(39)));
        assert!(!map.get(chunk_to_bin(50)));
    }

    #[test]
    fn test_set_new() {
        let mut map = AvailabilityMap::new(64);
        map.set(&Address::chunk(1), true);
        assert_eq!(map.set_new(&Address::from_bin(3)), vec![0, 4, 6]);
        assert!(map.set_new(&Address::from_bin(3)).is_empty());
    }

    #[test]
    fn test_ranges() {
        let mut map = AvailabilityMap::new(64);
        map.set(&Address::from_range(2, 8), true);
        map.set(&Address::chunk(7), true);
        map.set(&Address::chunk(8), true);
        assert_eq!(map.ranges(), vec![Address::from_range(2, 8), Address::from_range(14, 16)]);
    }

    #[test]
    fn test_window_slides() {
        let mut map = AvailabilityMap::new(8);
        map.set(&Address::chunk(0), true);
        map.set(&Address::chunk(20), true);
        assert_eq!(map.min(), Some(40));
        assert!(!map.get(0));
    }
}
