use crate::addressing::Address;
use crate::util::buf_ext::BufExt;
use crate::wire::{ProtocolOptions, Timestamp, WireCodec};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    Data = 1,
    Ack = 2,
    Have = 3,
    Integrity = 4,
    PexResV4 = 5,
    PexReq = 6,
    SignedIntegrity = 7,
    Request = 8,
    Cancel = 9,
    Choke = 10,
    Unchoke = 11,
    PexResV6 = 12,
    PexResCert = 13,
}
impl MessageType {
    /// the message types this implementation sends and understands
    pub const SUPPORTED: [MessageType; 10] = [
        MessageType::Handshake,
        MessageType::Data,
        MessageType::Ack,
        MessageType::Have,
        MessageType::Integrity,
        MessageType::SignedIntegrity,
        MessageType::Request,
        MessageType::Cancel,
        MessageType::Choke,
        MessageType::Unchoke,
    ];
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeMessage {
    /// the sender's channel id for this connection, 0 to close the channel
    pub channel_id: u32,
    pub options: ProtocolOptions,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataMessage {
    pub address: Address,
    pub timestamp: Timestamp,
    pub data: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckMessage {
    pub address: Address,
    /// one-way delay of the acknowledged DATA message as observed by the receiver
    pub delay_sample: Timestamp,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntegrityMessage {
    pub address: Address,
    pub hash: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedIntegrityMessage {
    pub address: Address,
    pub timestamp: Timestamp,
    pub signature: Bytes,
}


/// All messages exchanged inside a swarm. Each is a one-byte type tag followed by a
///  type specific payload whose layout depends on the swarm's [WireCodec].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    Data(DataMessage),
    Ack(AckMessage),
    Have(Address),
    Integrity(IntegrityMessage),
    SignedIntegrity(SignedIntegrityMessage),
    Request(Address),
    Cancel(Address),
    Choke,
    Unchoke,
}
impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Data(_) => MessageType::Data,
            Message::Ack(_) => MessageType::Ack,
            Message::Have(_) => MessageType::Have,
            Message::Integrity(_) => MessageType::Integrity,
            Message::SignedIntegrity(_) => MessageType::SignedIntegrity,
            Message::Request(_) => MessageType::Request,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
        }
    }

    /// serialized length including the type tag
    pub fn byte_len(&self, codec: &WireCodec) -> usize {
        let payload_len = match self {
            Message::Handshake(m) => 4 + m.options.byte_len(),
            Message::Data(m) => codec.address_len() + Timestamp::BYTE_LEN + m.data.len(),
            Message::Ack(_) => codec.address_len() + Timestamp::BYTE_LEN,
            Message::Have(_) | Message::Request(_) | Message::Cancel(_) => codec.address_len(),
            Message::Integrity(_) => codec.address_len() + codec.hash_len,
            Message::SignedIntegrity(_) => codec.address_len() + Timestamp::BYTE_LEN + codec.signature_len,
            Message::Choke | Message::Unchoke => 0,
        };
        1 + payload_len
    }

    pub fn ser(&self, codec: &WireCodec, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type().into());
        match self {
            Message::Handshake(m) => {
                buf.put_u32(m.channel_id);
                m.options.ser(buf);
            }
            Message::Data(m) => {
                codec.ser_address(&m.address, buf);
                m.timestamp.ser(buf);
                buf.put_slice(&m.data);
            }
            Message::Ack(m) => {
                codec.ser_address(&m.address, buf);
                m.delay_sample.ser(buf);
            }
            Message::Have(address) | Message::Request(address) | Message::Cancel(address) => {
                codec.ser_address(address, buf);
            }
            Message::Integrity(m) => {
                codec.ser_address(&m.address, buf);
                put_fixed(buf, &m.hash, codec.hash_len);
            }
            Message::SignedIntegrity(m) => {
                codec.ser_address(&m.address, buf);
                m.timestamp.ser(buf);
                put_fixed(buf, &m.signature, codec.signature_len);
            }
            Message::Choke | Message::Unchoke => {}
        }
    }

    pub fn try_deser(codec: &WireCodec, buf: &mut impl Buf) -> anyhow::Result<Message> {
        let raw_type = buf.try_read_u8()?;
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown message type {}", raw_type))?;

        let result = match message_type {
            MessageType::Handshake => {
                let channel_id = buf.try_read_u32()?;
                let options = ProtocolOptions::try_deser(buf)?;
                Message::Handshake(HandshakeMessage { channel_id, options })
            }
            MessageType::Data => {
                let address = codec.try_deser_address(buf)?;
                let timestamp = Timestamp::try_deser(buf)?;
                let data_len = codec.range_byte_len(&address)?.min(buf.remaining());
                let data = buf.copy_to_bytes(data_len);
                Message::Data(DataMessage { address, timestamp, data })
            }
            MessageType::Ack => {
                let address = codec.try_deser_address(buf)?;
                let delay_sample = Timestamp::try_deser(buf)?;
                Message::Ack(AckMessage { address, delay_sample })
            }
            MessageType::Have => Message::Have(codec.try_deser_address(buf)?),
            MessageType::Integrity => {
                let address = codec.try_deser_address(buf)?;
                let hash = buf.try_read_bytes(codec.hash_len)?;
                Message::Integrity(IntegrityMessage { address, hash })
            }
            MessageType::SignedIntegrity => {
                let address = codec.try_deser_address(buf)?;
                let timestamp = Timestamp::try_deser(buf)?;
                let signature = buf.try_read_bytes(codec.signature_len)?;
                Message::SignedIntegrity(SignedIntegrityMessage { address, timestamp, signature })
            }
            MessageType::Request => Message::Request(codec.try_deser_address(buf)?),
            MessageType::Cancel => Message::Cancel(codec.try_deser_address(buf)?),
            MessageType::Choke => Message::Choke,
            MessageType::Unchoke => Message::Unchoke,
            MessageType::PexResV4 | MessageType::PexReq | MessageType::PexResV6 | MessageType::PexResCert => {
                bail!("unsupported message type {:?}", message_type)
            }
        };
        Ok(result)
    }
}

/// writes exactly `len` bytes, truncating or zero padding `data`
fn put_fixed(buf: &mut impl BufMut, data: &[u8], len: usize) {
    let n = data.len().min(len);
    buf.put_slice(&data[..n]);
    buf.put_bytes(0, len - n);
}
