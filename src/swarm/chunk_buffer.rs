use crate::addressing::{Address, Bin};
use crate::util::ring_buffer::BinRingBuffer;
use bytes::Bytes;


/// Payloads of the chunks in the live window, by chunk bin
pub struct ChunkBuffer {
    chunks: BinRingBuffer<Option<Bytes>>,
}
impl ChunkBuffer {
    pub fn new(capacity_chunks: usize) -> ChunkBuffer {
        ChunkBuffer {
            chunks: BinRingBuffer::new(capacity_chunks),
        }
    }

    /// Returns false if the chunk is older than the window.
    pub fn set(&mut self, bin: Bin, data: Bytes) -> bool {
        match self.chunks.get_or_advance(bin) {
            Some(slot) => {
                *slot = Some(data);
                true
            }
            None => false,
        }
    }

    /// stores consecutive chunks starting at the address' first chunk
    pub fn set_range(&mut self, address: &Address, chunks: &[Bytes]) {
        for (bin, data) in address.chunk_bins().zip(chunks) {
            self.set(bin, data.clone());
        }
    }

    pub fn get(&self, bin: Bin) -> Option<Bytes> {
        self.chunks.get(bin)
            .and_then(|slot| slot.clone())
    }

    pub fn contains(&self, bin: Bin) -> bool {
        self.chunks.get(bin).is_some_and(|slot| slot.is_some())
    }

    /// all chunks of the address in order, or `None` if any of them is missing
    pub fn read(&self, address: &Address) -> Option<Vec<Bytes>> {
        address.chunk_bins()
            .map(|bin| self.get(bin))
            .collect()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn chunk(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[test]
    fn test_set_and_read() {
        let mut buffer = ChunkBuffer::new(8);
        assert!(buffer.read(&Address::chunk(0)).is_none());

        buffer.set_range(&Address::from_chunk_range(0, 3), &[chunk(0), chunk(1), chunk(2), chunk(3)]);
        assert_eq!(buffer.get(4), Some(chunk(2)));
        assert!(buffer.contains(6));
        assert_eq!(buffer.read(&Address::from_chunk_range(1, 2)), Some(vec![chunk(1), chunk(2)]));
        assert!(buffer.read(&Address::from_chunk_range(3, 4)).is_none());
    }

    #[test]
    fn test_window() {
        let mut buffer = ChunkBuffer::new(4);
        assert!(buffer.set(0, chunk(0)));
        assert!(buffer.set(14, chunk(7)));
        assert!(!buffer.contains(0));
        assert!(!buffer.set(0, chunk(0)));
        assert!(buffer.set(8, chunk(4)));
        assert_eq!(buffer.read(&Address::from_chunk_range(4, 4)), Some(vec![chunk(4)]));
    }
}
