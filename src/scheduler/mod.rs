//! Decides what to request from whom and what to send to whom. The scheduler owns all
//!  per-peer and per-chunk bookkeeping of a swarm; the swarm's protocol layer feeds it events
//!  and turns its decisions into messages.

mod chunk_state;
mod config;
mod peer_state;
#[allow(clippy::module_inception)]
mod scheduler;

pub use chunk_state::ChunkState;
pub use config::SchedulerConfig;
pub use peer_state::{PeerState, PeerStats, PendingRequests};
pub use scheduler::{PeerCycle, ReceiveOutcome, Scheduler, SchedulerStats};

use std::fmt::{Display, Formatter};

/// Identifies a peer within one swarm
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerId(pub u32);
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
