use crate::addressing::{chunk_to_bin, Bin};

/// Values stored in a [RingBuffer] are reset in place when their slot is reused for a newer
///  index, without reallocating
pub trait Recycle {
    fn recycle(&mut self);
}
impl <T> Recycle for Option<T> {
    fn recycle(&mut self) {
        *self = None;
    }
}
impl Recycle for u64 {
    fn recycle(&mut self) {
        *self = 0;
    }
}


struct Slot<T> {
    index: Option<u64>,
    value: T,
}

/// A fixed-capacity circular buffer addressed by a monotonically growing index. Accessing an
///  index beyond the newest one advances the window, and the slots of indexes that dropped out
///  of the window are recycled lazily when they are reused.
///
/// The window always covers the `capacity` indexes ending at the newest index seen so far.
pub struct RingBuffer<T> {
    slots: Vec<Slot<T>>,
    newest: Option<u64>,
}
impl <T: Default + Recycle> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        RingBuffer {
            slots: (0..capacity)
                .map(|_| Slot { index: None, value: T::default() })
                .collect(),
            newest: None,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn newest(&self) -> Option<u64> {
        self.newest
    }

    /// lowest index that is still inside the window
    pub fn oldest(&self) -> Option<u64> {
        self.newest
            .map(|n| n.saturating_sub(self.capacity() - 1))
    }

    pub fn in_window(&self, index: u64) -> bool {
        match self.newest {
            None => false,
            Some(newest) => index <= newest && index + self.capacity() > newest,
        }
    }

    fn position(&self, index: u64) -> usize {
        (index % self.capacity()) as usize
    }

    /// returns the value stored for an index, if it is inside the window and was written since
    ///  its slot was last recycled
    pub fn get(&self, index: u64) -> Option<&T> {
        if !self.in_window(index) {
            return None;
        }
        let slot = &self.slots[self.position(index)];
        if slot.index == Some(index) {
            Some(&slot.value)
        }
        else {
            None
        }
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut T> {
        if !self.in_window(index) {
            return None;
        }
        let position = self.position(index);
        let slot = &mut self.slots[position];
        if slot.index == Some(index) {
            Some(&mut slot.value)
        }
        else {
            None
        }
    }

    /// Returns a mutable reference to an index's value, advancing the window if the index is
    ///  newer than anything seen so far. Indexes that already fell out of the window return
    ///  `None`.
    pub fn get_or_advance(&mut self, index: u64) -> Option<&mut T> {
        match self.newest {
            Some(newest) if index + self.capacity() <= newest => return None,
            Some(newest) if index <= newest => {}
            _ => self.newest = Some(index),
        }

        let position = self.position(index);
        let slot = &mut self.slots[position];
        if slot.index != Some(index) {
            slot.value.recycle();
            slot.index = Some(index);
        }
        Some(&mut slot.value)
    }

    /// iterates over all live entries in ascending index order
    pub fn iter(&self) -> impl Iterator<Item=(u64, &T)> + '_ {
        let range = match (self.oldest(), self.newest) {
            (Some(oldest), Some(newest)) => oldest..newest+1,
            _ => 0..0,
        };
        range.filter_map(|index| self.get(index).map(|v| (index, v)))
    }
}


/// A [RingBuffer] addressed by chunk bins, one slot per chunk
pub struct BinRingBuffer<T> {
    inner: RingBuffer<T>,
}
impl <T: Default + Recycle> BinRingBuffer<T> {
    pub fn new(capacity_chunks: usize) -> BinRingBuffer<T> {
        BinRingBuffer {
            inner: RingBuffer::new(capacity_chunks),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    pub fn newest_bin(&self) -> Option<Bin> {
        self.inner.newest().map(chunk_to_bin)
    }

    pub fn oldest_bin(&self) -> Option<Bin> {
        self.inner.oldest().map(chunk_to_bin)
    }

    pub fn in_window(&self, bin: Bin) -> bool {
        self.inner.in_window(bin / 2)
    }

    pub fn get(&self, bin: Bin) -> Option<&T> {
        self.inner.get(bin / 2)
    }

    pub fn get_mut(&mut self, bin: Bin) -> Option<&mut T> {
        self.inner.get_mut(bin / 2)
    }

    pub fn get_or_advance(&mut self, bin: Bin) -> Option<&mut T> {
        self.inner.get_or_advance(bin / 2)
    }

    pub fn iter(&self) -> impl Iterator<Item=(Bin, &T)> + '_ {
        self.inner.iter()
            .map(|(index, v)| (chunk_to_bin(index), v))
    }
}
