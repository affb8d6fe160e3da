use crate::util::buf_ext::BufExt;
use crate::wire::{Message, WireCodec};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// the largest message a transport data channel carries
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// A channel id followed by back-to-back messages. The transport delimits datagrams, so there
///  is no length field and no end marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub channel_id: u32,
    pub messages: Vec<Message>,
}
impl Datagram {
    pub fn byte_len(&self, codec: &WireCodec) -> usize {
        4 + self.messages.iter()
            .map(|m| m.byte_len(codec))
            .sum::<usize>()
    }

    pub fn ser(&self, codec: &WireCodec, buf: &mut impl BufMut) {
        buf.put_u32(self.channel_id);
        for message in &self.messages {
            message.ser(codec, buf);
        }
    }

    pub fn to_bytes(&self, codec: &WireCodec) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_len(codec));
        self.ser(codec, &mut buf);
        buf.freeze()
    }

    /// consumes the entire buffer; any undecodable message fails the whole datagram
    pub fn try_deser(codec: &WireCodec, buf: &mut impl Buf) -> anyhow::Result<Datagram> {
        let channel_id = buf.try_read_u32()?;
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(Message::try_deser(codec, buf)?);
        }
        Ok(Datagram { channel_id, messages })
    }
}


/// Collects the messages for one flush to a peer and splits them into datagrams that fit into
///  the transport's message size limit. Messages are never split.
pub struct DatagramBuilder<'a> {
    codec: &'a WireCodec,
    channel_id: u32,
    max_size: usize,
    current: Vec<Message>,
    current_len: usize,
    finished: Vec<Bytes>,
}
impl <'a> DatagramBuilder<'a> {
    pub fn new(codec: &'a WireCodec, channel_id: u32, max_size: usize) -> DatagramBuilder<'a> {
        DatagramBuilder {
            codec,
            channel_id,
            max_size,
            current: Vec::new(),
            current_len: 4,
            finished: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        let len = message.byte_len(self.codec);
        if self.current_len + len > self.max_size && !self.current.is_empty() {
            self.flush_current();
        }
        if 4 + len > self.max_size {
            warn!("message of type {:?} exceeds the datagram size limit ({} bytes) - sending it anyway", message.message_type(), len);
        }
        // the payload of a DATA message runs to the end of the datagram unless it fills the range
        let ends_datagram = match &message {
            Message::Data(data) => self.codec.range_byte_len(&data.address)
                .map(|range_len| data.data.len() < range_len)
                .unwrap_or(true),
            _ => false,
        };

        self.current_len += len;
        self.current.push(message);
        if ends_datagram {
            self.flush_current();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.finished.is_empty()
    }

    fn flush_current(&mut self) {
        let datagram = Datagram {
            channel_id: self.channel_id,
            messages: std::mem::take(&mut self.current),
        };
        self.finished.push(datagram.to_bytes(self.codec));
        self.current_len = 4;
    }

    pub fn finish(mut self) -> Vec<Bytes> {
        if !self.current.is_empty() {
            self.flush_current();
        }
        self.finished
    }
}
