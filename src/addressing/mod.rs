//! Bin numbers address chunks and aligned power-of-two ranges of chunks in a single integer:
//!  even bins are chunks (chunk `i` is bin `2i`), and a bin on layer `l` (i.e. with `l` trailing
//!  one bits) covers `2^l` consecutive chunks.

use std::fmt::{Debug, Formatter};

pub type Bin = u64;

pub fn chunk_to_bin(chunk_index: u64) -> Bin {
    chunk_index * 2
}

pub fn bin_to_chunk(bin: Bin) -> u64 {
    bin / 2
}

/// number of trailing one bits, i.e. the tree layer a bin lives on
pub fn layer(bin: Bin) -> u32 {
    bin.trailing_ones()
}

/// the first and last chunk bins covered by a bin (both even, both inclusive)
pub fn bounds_of(bin: Bin) -> (Bin, Bin) {
    let next = bin.wrapping_add(1);
    (bin & next, (bin | next).wrapping_sub(1))
}

pub fn chunk_count_of(bin: Bin) -> u64 {
    1 << layer(bin)
}

pub fn parent(bin: Bin) -> Bin {
    let chunk_count = chunk_count_of(bin);
    let (start, _) = bounds_of(bin);
    let parent_start = start & !(4 * chunk_count - 1);
    parent_start + 2 * chunk_count - 1
}

pub fn sibling(bin: Bin) -> Bin {
    let p = parent(bin);
    2 * p - bin
}

/// children of a bin on layer one or above
pub fn children(bin: Bin) -> Option<(Bin, Bin)> {
    match layer(bin) {
        0 => None,
        l => {
            let half = 1u64 << (l - 1);
            Some((bin - half, bin + half))
        }
    }
}


/// A contiguous, possibly unaligned range of chunks. `bin` is the smallest bin covering the
///  range; `start` and `end` are the first and last chunk bins in the range (both even).
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Address {
    pub bin: Bin,
    pub start: Bin,
    pub end: Bin,
}
impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..={} @{}]", self.start, self.end, self.bin)
    }
}
impl Address {
    pub fn from_bin(bin: Bin) -> Address {
        let (start, end) = bounds_of(bin);
        Address { bin, start, end }
    }

    pub fn chunk(chunk_index: u64) -> Address {
        Address::from_bin(chunk_to_bin(chunk_index))
    }

    /// `start` and `end` are chunk bins, `start <= end`
    pub fn from_range(start: Bin, end: Bin) -> Address {
        debug_assert!(start % 2 == 0 && end % 2 == 0 && start <= end, "invalid chunk bin range {}..={}", start, end);

        let mut bin = start;
        loop {
            let (s, e) = bounds_of(bin);
            if s <= start && e >= end {
                break;
            }
            bin = parent(bin);
        }
        Address { bin, start, end }
    }

    pub fn from_chunk_range(start_chunk: u64, end_chunk: u64) -> Address {
        Address::from_range(chunk_to_bin(start_chunk), chunk_to_bin(end_chunk))
    }

    pub fn start_chunk(&self) -> u64 {
        bin_to_chunk(self.start)
    }

    pub fn end_chunk(&self) -> u64 {
        bin_to_chunk(self.end)
    }

    pub fn chunk_count(&self) -> u64 {
        (self.end - self.start) / 2 + 1
    }

    /// true if the range is exactly the range of its covering bin
    pub fn is_aligned(&self) -> bool {
        bounds_of(self.bin) == (self.start, self.end)
    }

    /// true if all chunks covered by `bin` are in this range
    pub fn contains_bin(&self, bin: Bin) -> bool {
        let (start, end) = bounds_of(bin);
        self.start <= start && end <= self.end
    }

    /// chunk bins in ascending order
    pub fn chunk_bins(&self) -> impl Iterator<Item=Bin> {
        (self.start..=self.end).step_by(2)
    }

    /// Splits the range into the minimal sequence of aligned bins covering it, in ascending
    ///  order. This is what bin based addressing methods can put on the wire.
    pub fn to_aligned(&self) -> Vec<Address> {
        let mut result = Vec::new();
        let mut start = self.start;
        while start <= self.end {
            let mut bin = start;
            loop {
                let p = parent(bin);
                let (ps, pe) = bounds_of(p);
                if ps != start || pe > self.end {
                    break;
                }
                bin = p;
            }
            let address = Address::from_bin(bin);
            start = address.end + 2;
            result.push(address);
        }
        result
    }
}
