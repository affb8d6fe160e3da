//! The protocol layer of a swarm: peers and their handshakes, message dispatch, and the glue
//!  between wire encoding, integrity protection and the scheduler.

mod chunk_buffer;
mod config;
mod driver;
mod events;
mod peer;
#[allow(clippy::module_inception)]
mod swarm;

pub use chunk_buffer::ChunkBuffer;
pub use config::SwarmConfig;
pub use driver::{ChannelKey, PeerChannel, SwarmDriver, SwarmInput};
#[cfg(test)] pub use driver::MockPeerChannel;
pub use events::{DataAvailableData, PeerAddedData, PeerRemovedData, SwarmEvent, SwarmEventNotifier};
pub use peer::{HandshakeOutcome, Peer, PeerConnectionState};
pub use swarm::{Swarm, SwarmStats, VerificationJob, VerificationResult};
