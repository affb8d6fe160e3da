use crate::addressing::{bounds_of, Address, Bin};
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{ChunkAddressingMethod, MerkleHashTreeFunction, SwarmId};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};


/// The encoding parameters of a swarm, resolved once from its URI: how addresses look on the
///  wire, and how long hashes, signatures and chunks are.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireCodec {
    pub addressing_method: ChunkAddressingMethod,
    pub hash_len: usize,
    pub signature_len: usize,
    pub chunk_size: u32,
}
impl WireCodec {
    pub fn new(addressing_method: ChunkAddressingMethod, hash_function: MerkleHashTreeFunction, swarm_id: &SwarmId, chunk_size: u32) -> anyhow::Result<WireCodec> {
        if addressing_method == ChunkAddressingMethod::ByteRange64 {
            bail!("byte range addressing is not supported for live streams");
        }
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        Ok(WireCodec {
            addressing_method,
            hash_len: hash_function.digest_len(),
            signature_len: swarm_id.signature_len(),
            chunk_size,
        })
    }

    pub fn is_bin_addressing(&self) -> bool {
        matches!(self.addressing_method, ChunkAddressingMethod::Bin32 | ChunkAddressingMethod::Bin64)
    }

    pub fn address_len(&self) -> usize {
        match self.addressing_method {
            ChunkAddressingMethod::Bin32 => 4,
            ChunkAddressingMethod::ChunkRange32 | ChunkAddressingMethod::Bin64 => 8,
            ChunkAddressingMethod::ByteRange64 | ChunkAddressingMethod::ChunkRange64 => 16,
        }
    }

    /// Splits an address into the pieces this addressing method can express: aligned bins for
    ///  bin addressing, the unchanged range otherwise
    pub fn wire_addresses(&self, address: &Address) -> Vec<Address> {
        if self.is_bin_addressing() && !address.is_aligned() {
            address.to_aligned()
        }
        else {
            vec![*address]
        }
    }

    /// `address` must be expressible in this addressing method, see [WireCodec::wire_addresses]
    pub fn ser_address(&self, address: &Address, buf: &mut impl BufMut) {
        match self.addressing_method {
            ChunkAddressingMethod::Bin32 => buf.put_u32(address.bin.prechecked_cast()),
            ChunkAddressingMethod::Bin64 => buf.put_u64(address.bin),
            ChunkAddressingMethod::ChunkRange32 => {
                buf.put_u32(address.start_chunk().prechecked_cast());
                buf.put_u32(address.end_chunk().prechecked_cast());
            }
            ChunkAddressingMethod::ChunkRange64 | ChunkAddressingMethod::ByteRange64 => {
                buf.put_u64(address.start_chunk());
                buf.put_u64(address.end_chunk());
            }
        }
    }

    pub fn try_deser_address(&self, buf: &mut impl Buf) -> anyhow::Result<Address> {
        let address = match self.addressing_method {
            ChunkAddressingMethod::Bin32 => Address::from_bin(buf.try_read_u32()?.safe_cast()),
            ChunkAddressingMethod::Bin64 => {
                let bin: Bin = buf.try_read_u64()?;
                // same limit as for chunk ranges: chunk indexes below 2^62
                if bounds_of(bin).1 >= 1 << 63 {
                    bail!("bin {} out of range", bin);
                }
                Address::from_bin(bin)
            }
            ChunkAddressingMethod::ChunkRange32 => {
                let start: u64 = buf.try_read_u32()?.safe_cast();
                let end: u64 = buf.try_read_u32()?.safe_cast();
                Self::chunk_range(start, end)?
            }
            ChunkAddressingMethod::ChunkRange64 => {
                let start = buf.try_read_u64()?;
                let end = buf.try_read_u64()?;
                if end >= (1 << 62) {
                    bail!("chunk {} out of range", end);
                }
                Self::chunk_range(start, end)?
            }
            ChunkAddressingMethod::ByteRange64 => bail!("byte range addressing is not supported"),
        };
        Ok(address)
    }

    fn chunk_range(start: u64, end: u64) -> anyhow::Result<Address> {
        if start > end {
            bail!("invalid chunk range {}..={}", start, end);
        }
        Ok(Address::from_chunk_range(start, end))
    }

    /// the number of payload bytes a DATA message for `address` carries at most
    pub fn range_byte_len(&self, address: &Address) -> anyhow::Result<usize> {
        let chunk_size: u64 = self.chunk_size.safe_cast();
        address.chunk_count()
            .checked_mul(chunk_size)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| anyhow!("{:?} is too large to be transferred", address))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use rstest::rstest;

    fn codec(addressing_method: ChunkAddressingMethod) -> WireCodec {
        WireCodec::new(addressing_method, MerkleHashTreeFunction::Sha256, &SwarmId::ed25519(Bytes::from(vec![1u8; 32])), 1024).unwrap()
    }

    #[rstest]
    #[case::bin32(ChunkAddressingMethod::Bin32, Address::from_bin(7), vec![0, 0, 0, 7])]
    #[case::bin64(ChunkAddressingMethod::Bin64, Address::from_bin(5), vec![0, 0, 0, 0, 0, 0, 0, 5])]
    #[case::chunk_range32(ChunkAddressingMethod::ChunkRange32, Address::from_range(4, 10), vec![0, 0, 0, 2, 0, 0, 0, 5])]
    #[case::chunk_range64(ChunkAddressingMethod::ChunkRange64, Address::chunk(1), vec![0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1])]
    fn test_address_encoding(#[case] addressing_method: ChunkAddressingMethod, #[case] address: Address, #[case] expected: Vec<u8>) {
        let codec = codec(addressing_method);
        let mut buf = BytesMut::new();
        codec.ser_address(&address, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), codec.address_len());

        let mut b: &[u8] = &buf;
        assert_eq!(codec.try_deser_address(&mut b).unwrap(), address);
    }

    #[rstest]
    #[case::bin_aligned(ChunkAddressingMethod::Bin32, Address::from_range(0, 6), vec![3])]
    #[case::bin_unaligned(ChunkAddressingMethod::Bin64, Address::from_range(2, 8), vec![2, 5, 8])]
    #[case::range(ChunkAddressingMethod::ChunkRange32, Address::from_range(2, 8), vec![7 /* covering bin */])]
    fn test_wire_addresses(#[case] addressing_method: ChunkAddressingMethod, #[case] address: Address, #[case] expected_bins: Vec<Bin>) {
        let bins = codec(addressing_method).wire_addresses(&address)
            .iter()
            .map(|a| a.bin)
            .collect::<Vec<_>>();
        assert_eq!(bins, expected_bins);
    }

    #[test]
    fn test_inverted_range() {
        let mut b: &[u8] = &[0, 0, 0, 5, 0, 0, 0, 2];
        assert!(codec(ChunkAddressingMethod::ChunkRange32).try_deser_address(&mut b).is_err());
    }

    #[test]
    fn test_byte_range_rejected() {
        assert!(WireCodec::new(ChunkAddressingMethod::ByteRange64, MerkleHashTreeFunction::Sha1, &SwarmId::ed25519(Bytes::from(vec![1u8; 32])), 1024).is_err());
    }

    #[test]
    fn test_range_byte_len() {
        assert_eq!(codec(ChunkAddressingMethod::Bin32).range_byte_len(&Address::from_bin(3)).unwrap(), 4096);
        assert!(codec(ChunkAddressingMethod::Bin64).range_byte_len(&Address::from_bin((1 << 62) - 1)).is_err());
        assert!(codec(ChunkAddressingMethod::ChunkRange64).range_byte_len(&Address::from_chunk_range(0, (1 << 62) - 1)).is_err());
    }

    #[rstest]
    #[case::all_ones(u64::MAX)]
    #[case::top_layer((1 << 63) - 1)]
    #[case::last_chunk(1 << 63)]
    fn test_bin64_out_of_range(#[case] bin: Bin) {
        let bytes = bin.to_be_bytes();
        let mut b: &[u8] = &bytes;
        assert!(codec(ChunkAddressingMethod::Bin64).try_deser_address(&mut b).is_err());
    }
}
