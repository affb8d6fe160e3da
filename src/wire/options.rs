use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::swarm_id::SwarmId;
use crate::wire::MessageType;
use anyhow::{anyhow, bail};
use bit_set::BitSet;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolOptionTag {
    Version = 0,
    MinimumVersion = 1,
    SwarmIdentifier = 2,
    ContentIntegrityProtectionMethod = 3,
    MerkleHashTreeFunction = 4,
    LiveSignatureAlgorithm = 5,
    ChunkAddressingMethod = 6,
    LiveDiscardWindow = 7,
    SupportedMessages = 8,
    ChunkSize = 9,
    EndOption = 255,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolVersion {
    Ppspp1 = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContentIntegrityProtectionMethod {
    None = 0,
    MerkleHashTree = 1,
    SignAll = 2,
    UnifiedMerkleTree = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MerkleHashTreeFunction {
    Sha1 = 0,
    Sha224 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
}
impl MerkleHashTreeFunction {
    pub fn digest_len(&self) -> usize {
        match self {
            MerkleHashTreeFunction::Sha1 => 20,
            MerkleHashTreeFunction::Sha224 => 28,
            MerkleHashTreeFunction::Sha256 => 32,
            MerkleHashTreeFunction::Sha384 => 48,
            MerkleHashTreeFunction::Sha512 => 64,
        }
    }
}

/// DNSSEC algorithm numbers
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LiveSignatureAlgorithm {
    RsaSha1 = 5,
    RsaSha256 = 8,
    EcdsaP256Sha256 = 13,
    EcdsaP384Sha384 = 14,
    Ed25519 = 15,
}
impl LiveSignatureAlgorithm {
    pub fn is_rsa(&self) -> bool {
        matches!(self, LiveSignatureAlgorithm::RsaSha1 | LiveSignatureAlgorithm::RsaSha256)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChunkAddressingMethod {
    Bin32 = 0,
    ByteRange64 = 1,
    ChunkRange32 = 2,
    Bin64 = 3,
    ChunkRange64 = 4,
}


/// The set of message types a peer understands, as a bitmap on the wire
#[derive(Clone, Default)]
pub struct SupportedMessages(BitSet);
impl SupportedMessages {
    pub fn new(message_types: &[MessageType]) -> SupportedMessages {
        let mut bits = BitSet::new();
        for &t in message_types {
            bits.insert(u8::from(t).safe_cast());
        }
        SupportedMessages(bits)
    }

    pub fn contains(&self, message_type: MessageType) -> bool {
        self.0.contains(u8::from(message_type).safe_cast())
    }

    fn bitmap_len(&self) -> usize {
        self.0.iter().max().map(|max| max / 8 + 1).unwrap_or(0)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        let len = self.bitmap_len();
        let mut bitmap = vec![0u8; len];
        for bit in self.0.iter() {
            bitmap[bit / 8] |= 0x80 >> (bit % 8);
        }
        buf.put_u8(len.prechecked_cast());
        buf.put_slice(&bitmap);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SupportedMessages> {
        let len = buf.try_read_u8()?.safe_cast();
        let bitmap = buf.try_read_bytes(len)?;
        let mut bits = BitSet::new();
        for (i, byte) in bitmap.iter().enumerate() {
            for j in 0..8 {
                if byte & (0x80 >> j) != 0 {
                    bits.insert(i * 8 + j);
                }
            }
        }
        Ok(SupportedMessages(bits))
    }
}
impl PartialEq for SupportedMessages {
    fn eq(&self, other: &Self) -> bool {
        self.0.iter().eq(other.0.iter())
    }
}
impl Eq for SupportedMessages {}
impl Debug for SupportedMessages {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}


/// The options carried in a HANDSHAKE. Every option is optional on the wire; options that are
///  present are serialized in ascending tag order and terminated by an end option.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProtocolOptions {
    pub version: Option<ProtocolVersion>,
    pub minimum_version: Option<ProtocolVersion>,
    pub swarm_id: Option<SwarmId>,
    pub integrity_method: Option<ContentIntegrityProtectionMethod>,
    pub hash_function: Option<MerkleHashTreeFunction>,
    pub signature_algorithm: Option<LiveSignatureAlgorithm>,
    pub addressing_method: Option<ChunkAddressingMethod>,
    pub live_discard_window: Option<u32>,
    pub supported_messages: Option<SupportedMessages>,
    pub chunk_size: Option<u32>,
}
impl ProtocolOptions {
    pub fn byte_len(&self) -> usize {
        let mut result = 1; // end option
        if self.version.is_some() { result += 2; }
        if self.minimum_version.is_some() { result += 2; }
        if let Some(swarm_id) = &self.swarm_id {
            result += 3 + swarm_id.byte_len();
        }
        if self.integrity_method.is_some() { result += 2; }
        if self.hash_function.is_some() { result += 2; }
        if self.signature_algorithm.is_some() { result += 2; }
        if self.addressing_method.is_some() { result += 2; }
        if self.live_discard_window.is_some() { result += 5; }
        if let Some(supported_messages) = &self.supported_messages {
            result += 2 + supported_messages.bitmap_len();
        }
        if self.chunk_size.is_some() { result += 5; }
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        if let Some(v) = self.version {
            buf.put_u8(ProtocolOptionTag::Version.into());
            buf.put_u8(v.into());
        }
        if let Some(v) = self.minimum_version {
            buf.put_u8(ProtocolOptionTag::MinimumVersion.into());
            buf.put_u8(v.into());
        }
        if let Some(swarm_id) = &self.swarm_id {
            buf.put_u8(ProtocolOptionTag::SwarmIdentifier.into());
            buf.put_u16(swarm_id.byte_len().prechecked_cast());
            swarm_id.ser(buf);
        }
        if let Some(v) = self.integrity_method {
            buf.put_u8(ProtocolOptionTag::ContentIntegrityProtectionMethod.into());
            buf.put_u8(v.into());
        }
        if let Some(v) = self.hash_function {
            buf.put_u8(ProtocolOptionTag::MerkleHashTreeFunction.into());
            buf.put_u8(v.into());
        }
        if let Some(v) = self.signature_algorithm {
            buf.put_u8(ProtocolOptionTag::LiveSignatureAlgorithm.into());
            buf.put_u8(v.into());
        }
        if let Some(v) = self.addressing_method {
            buf.put_u8(ProtocolOptionTag::ChunkAddressingMethod.into());
            buf.put_u8(v.into());
        }
        if let Some(v) = self.live_discard_window {
            buf.put_u8(ProtocolOptionTag::LiveDiscardWindow.into());
            buf.put_u32(v);
        }
        if let Some(v) = &self.supported_messages {
            buf.put_u8(ProtocolOptionTag::SupportedMessages.into());
            v.ser(buf);
        }
        if let Some(v) = self.chunk_size {
            buf.put_u8(ProtocolOptionTag::ChunkSize.into());
            buf.put_u32(v);
        }
        buf.put_u8(ProtocolOptionTag::EndOption.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ProtocolOptions> {
        let mut result = ProtocolOptions::default();
        loop {
            let raw_tag = buf.try_read_u8()?;
            let tag = ProtocolOptionTag::try_from(raw_tag)
                .map_err(|_| anyhow!("unknown protocol option {}", raw_tag))?;

            match tag {
                ProtocolOptionTag::Version => result.version = Some(read_enum(buf)?),
                ProtocolOptionTag::MinimumVersion => result.minimum_version = Some(read_enum(buf)?),
                ProtocolOptionTag::SwarmIdentifier => {
                    let len = buf.try_read_u16()?.safe_cast();
                    let raw = buf.try_read_bytes(len)?;
                    result.swarm_id = Some(SwarmId::try_deser(&mut raw.as_ref())?);
                }
                ProtocolOptionTag::ContentIntegrityProtectionMethod => result.integrity_method = Some(read_enum(buf)?),
                ProtocolOptionTag::MerkleHashTreeFunction => result.hash_function = Some(read_enum(buf)?),
                ProtocolOptionTag::LiveSignatureAlgorithm => result.signature_algorithm = Some(read_enum(buf)?),
                ProtocolOptionTag::ChunkAddressingMethod => result.addressing_method = Some(read_enum(buf)?),
                ProtocolOptionTag::LiveDiscardWindow => result.live_discard_window = Some(buf.try_read_u32()?),
                ProtocolOptionTag::SupportedMessages => result.supported_messages = Some(SupportedMessages::try_deser(buf)?),
                ProtocolOptionTag::ChunkSize => result.chunk_size = Some(buf.try_read_u32()?),
                ProtocolOptionTag::EndOption => break,
            }
        }
        Ok(result)
    }

    /// Checks that the options defining the swarm's content and encoding agree with `expected`.
    ///  Options `expected` leaves open are not checked; an option `expected` sets must be present
    ///  with the same value.
    pub fn check_compatible(&self, expected: &ProtocolOptions) -> anyhow::Result<()> {
        fn check<T: PartialEq + Debug>(name: &str, expected: &Option<T>, actual: &Option<T>) -> anyhow::Result<()> {
            match (expected, actual) {
                (Some(e), Some(a)) if e != a => bail!("{} mismatch: expected {:?}, got {:?}", name, e, a),
                (Some(e), None) => bail!("{} missing, expected {:?}", name, e),
                _ => Ok(()),
            }
        }

        if let Some(min_version) = self.minimum_version {
            if u8::from(min_version) > u8::from(ProtocolVersion::Ppspp1) {
                bail!("unsupported minimum protocol version {:?}", min_version);
            }
        }
        check("swarm id", &expected.swarm_id, &self.swarm_id)?;
        check("content integrity protection method", &expected.integrity_method, &self.integrity_method)?;
        check("merkle hash tree function", &expected.hash_function, &self.hash_function)?;
        check("live signature algorithm", &expected.signature_algorithm, &self.signature_algorithm)?;
        check("chunk addressing method", &expected.addressing_method, &self.addressing_method)?;
        check("chunk size", &expected.chunk_size, &self.chunk_size)?;
        Ok(())
    }
}

fn read_enum<T: TryFromPrimitive<Primitive=u8>>(buf: &mut impl Buf) -> anyhow::Result<T> {
    let raw = buf.try_read_u8()?;
    T::try_from_primitive(raw)
        .map_err(|_| anyhow!("invalid value {} for {}", raw, std::any::type_name::<T>()))
}


#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn swarm_id() -> SwarmId {
        SwarmId::ed25519(bytes::Bytes::from_static(&[7u8; 32]))
    }

    fn full_options() -> ProtocolOptions {
        ProtocolOptions {
            version: Some(ProtocolVersion::Ppspp1),
            minimum_version: Some(ProtocolVersion::Ppspp1),
            swarm_id: Some(swarm_id()),
            integrity_method: Some(ContentIntegrityProtectionMethod::UnifiedMerkleTree),
            hash_function: Some(MerkleHashTreeFunction::Sha256),
            signature_algorithm: Some(LiveSignatureAlgorithm::Ed25519),
            addressing_method: Some(ChunkAddressingMethod::ChunkRange32),
            live_discard_window: Some(64),
            supported_messages: Some(SupportedMessages::new(&[MessageType::Handshake, MessageType::Data, MessageType::Ack, MessageType::Unchoke])),
            chunk_size: Some(8192),
        }
    }

    #[rstest]
    #[case::empty(ProtocolOptions::default())]
    #[case::full(full_options())]
    #[case::partial(ProtocolOptions { version: Some(ProtocolVersion::Ppspp1), chunk_size: Some(1024), ..Default::default() })]
    fn test_ser_deser(#[case] options: ProtocolOptions) {
        let mut buf = BytesMut::new();
        options.ser(&mut buf);
        assert_eq!(buf.len(), options.byte_len());

        let mut b: &[u8] = &buf;
        let deser = ProtocolOptions::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, options);
    }

    #[test]
    fn test_supported_messages_bitmap() {
        let mut buf = BytesMut::new();
        SupportedMessages::new(&[MessageType::Handshake, MessageType::Data, MessageType::Unchoke]).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[2, 0b1100_0000, 0b0001_0000]);
    }

    #[rstest]
    #[case::unknown_tag(vec![42, 0])]
    #[case::missing_end(vec![0, 1])]
    #[case::bad_version(vec![0, 9, 255])]
    #[case::bad_hash_function(vec![4, 5, 255])]
    #[case::truncated_swarm_id(vec![2, 0, 10, 15, 1, 2])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert!(ProtocolOptions::try_deser(&mut b).is_err());
    }

    #[rstest]
    #[case::identical(full_options(), true)]
    #[case::only_swarm_id(ProtocolOptions { swarm_id: Some(swarm_id()), ..Default::default() }, false)]
    #[case::no_integrity_method(ProtocolOptions { integrity_method: None, ..full_options() }, false)]
    #[case::no_hash_function(ProtocolOptions { hash_function: None, ..full_options() }, false)]
    #[case::no_addressing(ProtocolOptions { addressing_method: None, ..full_options() }, false)]
    #[case::no_chunk_size(ProtocolOptions { chunk_size: None, ..full_options() }, false)]
    #[case::no_supported_messages(ProtocolOptions { supported_messages: None, live_discard_window: None, ..full_options() }, true)]
    #[case::chunk_size(ProtocolOptions { chunk_size: Some(1024), ..full_options() }, false)]
    #[case::addressing(ProtocolOptions { addressing_method: Some(ChunkAddressingMethod::Bin32), ..full_options() }, false)]
    #[case::swarm_id(ProtocolOptions { swarm_id: Some(SwarmId::ed25519(bytes::Bytes::from_static(&[8u8; 32]))), ..full_options() }, false)]
    #[case::live_discard_window(ProtocolOptions { live_discard_window: Some(1), ..full_options() }, true)]
    fn test_check_compatible(#[case] remote: ProtocolOptions, #[case] expected_ok: bool) {
        assert_eq!(remote.check_compatible(&full_options()).is_ok(), expected_ok);
    }
}
