//! The PPSPP wire format: datagrams of back-to-back messages, handshake protocol options, swarm
//!  ids and swarm URIs. All multi-byte integers are big-endian.

mod codec;
mod datagram;
mod messages;
mod options;
mod swarm_id;
mod timestamp;
mod uri;

pub use codec::WireCodec;
pub use datagram::{Datagram, DatagramBuilder, MAX_DATAGRAM_SIZE};
pub use messages::*;
pub use options::*;
pub use swarm_id::{RsaParameters, SwarmId};
pub use timestamp::Timestamp;
pub use uri::SwarmUri;
