use crate::scheduler::PeerId;
use crate::util::ring_buffer::Recycle;
use tokio::time::Instant;

/// Per-chunk bookkeeping of a scheduler. Lives in a ring buffer slot and is reset in place when
///  the slot is reused for a newer chunk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChunkState {
    /// number of peers known to have the chunk
    pub available_count: u32,
    pub requested: bool,
    pub requested_at: Option<Instant>,
    pub requested_by: Option<PeerId>,
    pub received: bool,
    /// data was received and is being verified; further copies are duplicates
    pub verifying: bool,
    pub verified: bool,
}
impl ChunkState {
    pub fn is_requestable(&self) -> bool {
        !self.requested && !self.verifying && !self.verified
    }

    pub fn clear_request(&mut self) {
        self.requested = false;
        self.requested_at = None;
        self.requested_by = None;
    }

    pub fn reset(&mut self) {
        *self = ChunkState::default();
    }
}
impl Recycle for ChunkState {
    fn recycle(&mut self) {
        self.reset();
    }
}
