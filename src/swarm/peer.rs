use crate::addressing::{bounds_of, Address, Bin};
use crate::scheduler::PeerId;
use crate::wire::{HandshakeMessage, Message, ProtocolOptions};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tracing::{debug, warn};


/// A peer's connection state. Only `Ready` peers take part in requesting and sending.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerConnectionState {
    /// the channel is open, waiting for the remote side's HANDSHAKE
    Connecting,
    /// we sent our HANDSHAKE, waiting for the reply
    AwaitingHandshake,
    Ready,
    /// the remote side choked us
    Choked,
    Closed,
}

/// What a received HANDSHAKE did to the peer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    /// the peer became ready; `reply` is true if our own HANDSHAKE is still due
    Opened { reply: bool },
    /// a retransmitted HANDSHAKE for a channel that is open already
    Repeated,
    /// the remote side closed the channel
    Closed,
}


/// Wire-level session state of one peer. Everything the scheduler needs lives in the
///  scheduler's peer state; this is only the protocol side.
pub struct Peer {
    id: PeerId,
    initiator: bool,
    state: PeerConnectionState,
    remote_channel_id: Option<u32>,
    remote_options: Option<ProtocolOptions>,
    /// tree bins whose hashes were sent to the peer
    known_hashes: FxHashSet<Bin>,
    /// INTEGRITY hashes that arrived before the subtree they belong to
    pending_integrity: VecDeque<(Address, Bytes)>,
    outbox: Vec<Message>,
}
impl Peer {
    pub fn new(id: PeerId, initiator: bool) -> Peer {
        Peer {
            id,
            initiator,
            state: PeerConnectionState::Connecting,
            remote_channel_id: None,
            remote_options: None,
            known_hashes: FxHashSet::default(),
            pending_integrity: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    /// true in both `Ready` and `Choked`: the handshake is complete
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PeerConnectionState::Ready | PeerConnectionState::Choked)
    }

    /// the channel id the remote side puts on datagrams for us
    pub fn local_channel_id(&self) -> u32 {
        self.id.0
    }

    pub fn remote_channel_id(&self) -> Option<u32> {
        self.remote_channel_id
    }

    pub fn remote_options(&self) -> Option<&ProtocolOptions> {
        self.remote_options.as_ref()
    }

    pub fn handshake_message(&self, options: &ProtocolOptions) -> Message {
        Message::Handshake(HandshakeMessage {
            channel_id: self.local_channel_id(),
            options: options.clone(),
        })
    }

    /// Queues our HANDSHAKE as the initiator of the channel
    pub fn start_handshake(&mut self, options: &ProtocolOptions) {
        let handshake = self.handshake_message(options);
        self.push(handshake);
        self.state = PeerConnectionState::AwaitingHandshake;
    }

    /// Processes a HANDSHAKE. Options that contradict the swarm's content-defining options
    ///  are an error, and the caller is expected to drop the peer.
    pub fn on_handshake(&mut self, handshake: HandshakeMessage, expected: &ProtocolOptions) -> anyhow::Result<HandshakeOutcome> {
        if handshake.channel_id == 0 {
            if self.is_ready() {
                debug!("{} closed the channel", self.id);
                self.state = PeerConnectionState::Closed;
                return Ok(HandshakeOutcome::Closed);
            }
            bail!("HANDSHAKE without a channel id from {}", self.id);
        }

        match self.state {
            PeerConnectionState::Connecting | PeerConnectionState::AwaitingHandshake => {}
            PeerConnectionState::Ready | PeerConnectionState::Choked => {
                if self.remote_channel_id == Some(handshake.channel_id) {
                    debug!("repeated HANDSHAKE from {} - ignoring", self.id);
                    return Ok(HandshakeOutcome::Repeated);
                }
                bail!("{} changed its channel id after the handshake", self.id);
            }
            PeerConnectionState::Closed => bail!("HANDSHAKE on closed channel to {}", self.id),
        }

        handshake.options.check_compatible(expected)?;

        let reply = self.state == PeerConnectionState::Connecting;
        self.remote_channel_id = Some(handshake.channel_id);
        self.remote_options = Some(handshake.options);
        self.state = PeerConnectionState::Ready;
        Ok(HandshakeOutcome::Opened { reply })
    }

    pub fn set_choked(&mut self, choked: bool) {
        match (self.state, choked) {
            (PeerConnectionState::Ready, true) => self.state = PeerConnectionState::Choked,
            (PeerConnectionState::Choked, false) => self.state = PeerConnectionState::Ready,
            _ => {}
        }
    }

    pub fn close(&mut self) {
        self.state = PeerConnectionState::Closed;
        self.outbox.clear();
    }

    pub fn known_hashes_mut(&mut self) -> &mut FxHashSet<Bin> {
        &mut self.known_hashes
    }

    /// forgets hashes for tree nodes that start before `oldest_bin`
    pub fn prune_known_hashes(&mut self, oldest_bin: Bin) {
        self.known_hashes.retain(|&bin| bounds_of(bin).0 >= oldest_bin);
    }

    pub fn buffer_integrity(&mut self, address: Address, hash: Bytes, limit: usize) {
        if self.pending_integrity.len() >= limit {
            warn!("too many INTEGRITY hashes from {} for unknown subtrees - dropping the oldest", self.id);
            self.pending_integrity.pop_front();
        }
        self.pending_integrity.push_back((address, hash));
    }

    pub fn take_pending_integrity(&mut self) -> VecDeque<(Address, Bytes)> {
        std::mem::take(&mut self.pending_integrity)
    }

    pub fn push(&mut self, message: Message) {
        if self.state == PeerConnectionState::Closed {
            return;
        }
        self.outbox.push(message);
    }

    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_keys, test_uri};
    use crate::wire::ChunkAddressingMethod;

    fn options() -> ProtocolOptions {
        test_uri(&test_keys(), 1024).protocol_options(64)
    }

    fn handshake(channel_id: u32, options: ProtocolOptions) -> HandshakeMessage {
        HandshakeMessage { channel_id, options }
    }

    #[test]
    fn test_initiator_handshake() {
        let mut peer = Peer::new(PeerId(3), true);
        peer.start_handshake(&options());
        assert_eq!(peer.state(), PeerConnectionState::AwaitingHandshake);
        assert_eq!(peer.take_outbox(), vec![Message::Handshake(handshake(3, options()))]);

        assert_eq!(peer.on_handshake(handshake(9, options()), &options()).unwrap(), HandshakeOutcome::Opened { reply: false });
        assert!(peer.is_ready());
        assert_eq!(peer.remote_channel_id(), Some(9));
        assert_eq!(peer.remote_options(), Some(&options()));
    }

    #[test]
    fn test_responder_handshake() {
        let mut peer = Peer::new(PeerId(1), false);
        assert_eq!(peer.state(), PeerConnectionState::Connecting);
        assert_eq!(peer.on_handshake(handshake(5, options()), &options()).unwrap(), HandshakeOutcome::Opened { reply: true });
        assert_eq!(peer.state(), PeerConnectionState::Ready);

        // repeated, then changed
        assert_eq!(peer.on_handshake(handshake(5, options()), &options()).unwrap(), HandshakeOutcome::Repeated);
        assert!(peer.on_handshake(handshake(6, options()), &options()).is_err());
    }

    #[test]
    fn test_incompatible_options() {
        let mut peer = Peer::new(PeerId(1), false);
        let mut remote = options();
        remote.addressing_method = Some(ChunkAddressingMethod::Bin64);
        assert!(peer.on_handshake(handshake(5, remote), &options()).is_err());
        assert!(!peer.is_ready());
    }

    #[test]
    fn test_missing_chunk_size() {
        let mut peer = Peer::new(PeerId(1), false);
        let mut remote = options();
        remote.chunk_size = None;
        assert!(peer.on_handshake(handshake(5, remote), &options()).is_err());
        assert_eq!(peer.state(), PeerConnectionState::Connecting);
    }

    #[test]
    fn test_close() {
        let mut peer = Peer::new(PeerId(1), false);
        assert!(peer.on_handshake(handshake(0, options()), &options()).is_err());

        peer.on_handshake(handshake(5, options()), &options()).unwrap();
        assert_eq!(peer.on_handshake(handshake(0, ProtocolOptions::default()), &options()).unwrap(), HandshakeOutcome::Closed);
        assert_eq!(peer.state(), PeerConnectionState::Closed);
        peer.push(Message::Choke);
        assert!(peer.take_outbox().is_empty());
    }

    #[test]
    fn test_choke() {
        let mut peer = Peer::new(PeerId(1), false);
        peer.set_choked(true);
        assert_eq!(peer.state(), PeerConnectionState::Connecting);

        peer.on_handshake(handshake(5, options()), &options()).unwrap();
        peer.set_choked(true);
        assert_eq!(peer.state(), PeerConnectionState::Choked);
        assert!(peer.is_ready());
        peer.set_choked(false);
        assert_eq!(peer.state(), PeerConnectionState::Ready);
    }

    #[test]
    fn test_pending_integrity_limit() {
        let mut peer = Peer::new(PeerId(1), false);
        for chunk in 0..3 {
            peer.buffer_integrity(Address::chunk(chunk), Bytes::from_static(b"h"), 2);
        }
        let pending = peer.take_pending_integrity();
        assert_eq!(pending.iter().map(|(a, _)| a.start).collect::<Vec<_>>(), vec![2, 4]);
        assert!(peer.take_pending_integrity().is_empty());
    }

    #[test]
    fn test_prune_known_hashes() {
        let mut peer = Peer::new(PeerId(1), false);
        peer.known_hashes_mut().extend([0, 2, 5, 7, 8, 12]);
        peer.prune_known_hashes(8);
        let mut remaining = peer.known_hashes_mut().iter().copied().collect::<Vec<_>>();
        remaining.sort();
        assert_eq!(remaining, vec![8, 12]);
    }
}
