use crate::addressing::{Address, Bin};
use crate::integrity::{self, ChunkVerifier, IntegrityProtection, SwarmKeys, VerifiedPath};
use crate::scheduler::{PeerId, ReceiveOutcome, Scheduler};
use crate::swarm::{ChunkBuffer, DataAvailableData, HandshakeOutcome, Peer, PeerAddedData, PeerRemovedData, SwarmConfig, SwarmEvent, SwarmEventNotifier};
use crate::util::random::{Random, RngRandom};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{AckMessage, ContentIntegrityProtectionMethod, DataMessage, Datagram, DatagramBuilder, HandshakeMessage, IntegrityMessage, Message, ProtocolOptions, SignedIntegrityMessage, Timestamp, WireCodec};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SwarmStats {
    pub datagrams_received: u64,
    pub decode_errors: u64,
    /// datagrams carrying a channel id that is not ours
    pub misdirected_datagrams: u64,
    pub protocol_errors: u64,
    pub messages_before_handshake: u64,
    pub integrity_errors: u64,
    pub chunks_verified: u64,
}


/// A received chunk together with a snapshot of its hash path. Running it does not touch the
///  swarm, so it can be moved to a blocking thread.
pub struct VerificationJob {
    pub peer: PeerId,
    pub bin: Bin,
    delay_sample: Timestamp,
    data: Bytes,
    verifier: Box<dyn ChunkVerifier>,
}
impl VerificationJob {
    pub fn run(self) -> VerificationResult {
        let result = self.verifier.verify(&self.data);
        VerificationResult {
            peer: self.peer,
            bin: self.bin,
            delay_sample: self.delay_sample,
            data: self.data,
            result,
        }
    }
}

pub struct VerificationResult {
    pub peer: PeerId,
    pub bin: Bin,
    delay_sample: Timestamp,
    data: Bytes,
    pub result: anyhow::Result<VerifiedPath>,
}
impl VerificationResult {
    /// the result for a verification that did not run to completion
    pub fn failed(peer: PeerId, bin: Bin, error: anyhow::Error) -> VerificationResult {
        VerificationResult {
            peer,
            bin,
            delay_sample: Timestamp::default(),
            data: Bytes::new(),
            result: Err(error),
        }
    }
}


/// One live swarm as seen from this node: it owns the peers' protocol sessions, the integrity
///  state, the chunk payloads and the scheduler, and translates between them.
///
/// The swarm does no I/O. Datagrams are fed in through [Swarm::handle_datagram], outgoing
///  datagrams are collected with [Swarm::flush], and every peer's scheduling cycle is triggered
///  by calling [Swarm::run_peer] at the time returned by [Swarm::next_run]. Chunk verification
///  is handed out as [VerificationJob]s whose results go back in through
///  [Swarm::complete_verification]. [crate::swarm::SwarmDriver] wires all of this to tokio.
pub struct Swarm<R: Random = RngRandom> {
    config: Arc<SwarmConfig>,
    codec: WireCodec,
    local_options: ProtocolOptions,
    can_publish: bool,
    epoch: Instant,
    peers: FxHashMap<PeerId, Peer>,
    next_peer_id: u32,
    closed_peers: Vec<PeerId>,
    scheduler: Scheduler<R>,
    integrity: Box<dyn IntegrityProtection>,
    chunk_buffer: ChunkBuffer,
    notifier: SwarmEventNotifier,
    stats: SwarmStats,
}

impl <R: Random> Swarm<R> {
    pub fn new(config: Arc<SwarmConfig>, keys: &SwarmKeys, now: Instant) -> anyhow::Result<Swarm<R>> {
        config.validate()?;

        let codec = config.uri.codec()?;
        let integrity = integrity::for_swarm(&config.uri, keys, config.live_discard_window.into())?;
        let scheduler = Scheduler::new(Arc::new(config.scheduler.clone()), now)?;
        let can_publish = keys.can_sign() || config.uri.integrity_method == ContentIntegrityProtectionMethod::None;

        info!("joining swarm {} as {}", config.uri, if can_publish { "publisher" } else { "consumer" });

        Ok(Swarm {
            codec,
            local_options: config.uri.protocol_options(config.live_discard_window),
            can_publish,
            epoch: now,
            peers: FxHashMap::default(),
            next_peer_id: 1,
            closed_peers: Vec::new(),
            scheduler,
            integrity,
            chunk_buffer: ChunkBuffer::new(config.scheduler.window_capacity().prechecked_cast()),
            notifier: SwarmEventNotifier::new(config.event_buffer_size),
            stats: SwarmStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn codec(&self) -> &WireCodec {
        &self.codec
    }

    pub fn stats(&self) -> &SwarmStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &Scheduler<R> {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.notifier.subscribe()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn has_peer(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut result = self.peers.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// when the peer's next scheduling cycle is due
    pub fn next_run(&self, id: PeerId) -> Option<Instant> {
        self.scheduler.peer(id)
            .map(|p| p.next_run())
    }

    /// the payloads of the chunks in `address`, if all of them are still in the window
    pub fn read(&self, address: &Address) -> Option<Vec<Bytes>> {
        self.chunk_buffer.read(address)
    }

    /// Registers a new peer connection. The initiating side sends the first HANDSHAKE.
    pub fn add_peer(&mut self, initiator: bool, now: Instant) -> anyhow::Result<PeerId> {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id = self.next_peer_id.checked_add(1)
            .ok_or_else(|| anyhow!("peer ids are exhausted"))?;

        self.scheduler.add_peer(id, now)?;

        let mut peer = Peer::new(id, initiator);
        if initiator {
            peer.start_handshake(&self.local_options);
        }
        self.peers.insert(id, peer);

        debug!(initiator, "added {}", id);
        self.notifier.send_event(SwarmEvent::PeerAdded(PeerAddedData { peer: id, initiator }));
        Ok(id)
    }

    /// Removes a peer and everything the scheduler tracks for it. If `notify_remote` is set
    ///  and the channel is open, the returned datagram tells the remote side to close it.
    pub fn remove_peer(&mut self, id: PeerId, notify_remote: bool) -> Vec<Bytes> {
        let Some(mut peer) = self.peers.remove(&id) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        if notify_remote && peer.is_ready() {
            if let Some(channel_id) = peer.remote_channel_id() {
                let datagram = Datagram {
                    channel_id,
                    messages: vec![Message::Handshake(HandshakeMessage { channel_id: 0, options: ProtocolOptions::default() })],
                };
                result.push(datagram.to_bytes(&self.codec));
            }
        }

        peer.close();
        self.scheduler.remove_peer(id);

        debug!("removed {}", id);
        self.notifier.send_event(SwarmEvent::PeerRemoved(PeerRemovedData { peer: id }));
        result
    }

    /// peers the swarm dropped on its own since the last call, e.g. after a failed handshake
    pub fn take_closed_peers(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.closed_peers)
    }

    fn drop_peer(&mut self, id: PeerId) {
        self.remove_peer(id, false);
        self.closed_peers.push(id);
    }

    /// Processes a datagram received from a peer. Chunk payloads in it are not verified yet:
    ///  they come back as jobs, and their results must be passed to
    ///  [Swarm::complete_verification].
    pub fn handle_datagram(&mut self, id: PeerId, mut buf: Bytes, now: Instant) -> Vec<VerificationJob> {
        if !self.peers.contains_key(&id) {
            debug!("datagram for unknown {} - dropping", id);
            return Vec::new();
        }
        self.stats.datagrams_received += 1;

        let datagram = match Datagram::try_deser(&self.codec, &mut buf) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("undecodable datagram from {}: {}", id, e);
                self.stats.decode_errors += 1;
                return Vec::new();
            }
        };
        if datagram.channel_id != 0 && datagram.channel_id != id.0 {
            warn!("datagram from {} for channel {} - dropping", id, datagram.channel_id);
            self.stats.misdirected_datagrams += 1;
            return Vec::new();
        }

        let mut jobs = Vec::new();
        for message in datagram.messages {
            if !self.peers.contains_key(&id) {
                break;
            }
            match self.handle_message(id, message, now) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!("{}", e);
                    self.stats.protocol_errors += 1;
                }
            }
        }
        jobs
    }

    fn handle_message(&mut self, id: PeerId, message: Message, now: Instant) -> anyhow::Result<Option<VerificationJob>> {
        trace!("received {:?} from {}", message.message_type(), id);

        if !matches!(message, Message::Handshake(_)) {
            let is_ready = self.peers.get(&id).is_some_and(|p| p.is_ready());
            if !is_ready {
                self.stats.messages_before_handshake += 1;
                bail!("{:?} from {} before the handshake completed", message.message_type(), id);
            }
        }

        match message {
            Message::Handshake(handshake) => self.on_handshake(id, handshake, now)?,
            Message::Data(data) => return Ok(self.on_data(id, data, now)),
            Message::Ack(ack) => self.scheduler.mark_send_acked(id, &ack.address, ack.delay_sample.as_millis_f64(), now),
            Message::Have(address) => {
                self.scheduler.mark_chunk_available(id, &address);
            }
            Message::Integrity(integrity) => self.on_integrity(id, integrity),
            Message::SignedIntegrity(signed) => self.on_signed_integrity(id, signed)?,
            Message::Request(address) => {
                self.scheduler.enqueue_request(id, &address, now);
            }
            Message::Cancel(address) => self.scheduler.cancel_request(id, &address, now),
            Message::Choke => self.set_choked(id, true, now),
            Message::Unchoke => self.set_choked(id, false, now),
        }
        Ok(None)
    }

    fn on_handshake(&mut self, id: PeerId, handshake: HandshakeMessage, now: Instant) -> anyhow::Result<()> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };

        match peer.on_handshake(handshake, &self.local_options) {
            Ok(HandshakeOutcome::Opened { reply }) => {
                if reply {
                    let handshake = peer.handshake_message(&self.local_options);
                    peer.push(handshake);
                }
                for address in self.scheduler.loaded_ranges() {
                    peer.push(Message::Have(address));
                }
                self.scheduler.set_peer_ready(id, now);
                info!("channel to {} is open", id);
            }
            Ok(HandshakeOutcome::Repeated) => {}
            Ok(HandshakeOutcome::Closed) => self.drop_peer(id),
            Err(e) => {
                self.drop_peer(id);
                return Err(e.context(format!("closing channel to {}", id)));
            }
        }
        Ok(())
    }

    fn on_data(&mut self, id: PeerId, data: DataMessage, now: Instant) -> Option<VerificationJob> {
        if data.address.chunk_count() != 1 {
            warn!("DATA for {:?} from {} - only single chunks are supported", data.address, id);
            self.stats.protocol_errors += 1;
            return None;
        }
        let chunk_size: usize = self.config.uri.chunk_size.safe_cast();
        if data.data.len() > chunk_size {
            warn!("DATA of {} bytes from {} exceeds the chunk size", data.data.len(), id);
            self.stats.protocol_errors += 1;
            return None;
        }

        let bin = data.address.start;
        let delay_sample = Timestamp::since(self.epoch, now).minus(&data.timestamp);

        self.scheduler.mark_chunk_available(id, &data.address);
        match self.scheduler.mark_chunk_received(id, bin, data.data.len().prechecked_cast(), now) {
            ReceiveOutcome::Accepted => {}
            outcome => {
                // the sender still needs the ACK for its congestion control
                trace!("{:?} chunk {} from {}", outcome, bin, id);
                self.push_to(id, ack(bin, delay_sample));
                return None;
            }
        }

        match self.integrity.create_verifier(bin) {
            Ok(verifier) => Some(VerificationJob {
                peer: id,
                bin,
                delay_sample,
                data: data.data,
                verifier,
            }),
            Err(e) => {
                warn!("cannot verify chunk {} from {}: {}", bin, id, e);
                self.stats.integrity_errors += 1;
                self.scheduler.mark_chunk_rejected(id, bin);
                None
            }
        }
    }

    fn on_integrity(&mut self, id: PeerId, message: IntegrityMessage) {
        if self.integrity.on_integrity(&message.address, &message.hash) {
            return;
        }
        let limit = self.config.max_pending_integrity;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.buffer_integrity(message.address, message.hash, limit);
        }
    }

    fn on_signed_integrity(&mut self, id: PeerId, message: SignedIntegrityMessage) -> anyhow::Result<()> {
        if let Err(e) = self.integrity.on_signed_integrity(&message.address, message.timestamp, message.signature) {
            self.stats.integrity_errors += 1;
            return Err(e.context(format!("SIGNED_INTEGRITY from {}", id)));
        }

        // hashes that arrived ahead of their subtree
        let limit = self.config.max_pending_integrity;
        if let Some(peer) = self.peers.get_mut(&id) {
            for (address, hash) in peer.take_pending_integrity() {
                if !self.integrity.on_integrity(&address, &hash) {
                    peer.buffer_integrity(address, hash, limit);
                }
            }
        }
        Ok(())
    }

    fn set_choked(&mut self, id: PeerId, choked: bool, now: Instant) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.set_choked(choked);
        }
        self.scheduler.set_peer_choked(id, choked, now);
    }

    /// Applies the outcome of a [VerificationJob]. A verified chunk is stored, acknowledged and
    ///  announced to the peers that lack it; a rejected one is requested again later.
    pub fn complete_verification(&mut self, verification: VerificationResult) {
        let VerificationResult { peer, bin, delay_sample, data, result } = verification;

        match result {
            Ok(path) => {
                self.integrity.commit(path);
                self.chunk_buffer.set(bin, data);
                self.stats.chunks_verified += 1;

                for (target, address) in self.scheduler.mark_chunk_verified(bin) {
                    self.push_to(target, Message::Have(address));
                }
                self.push_to(peer, ack(bin, delay_sample));
            }
            Err(e) => {
                warn!("chunk {} from {} failed verification: {}", bin, peer, e);
                self.stats.integrity_errors += 1;
                self.scheduler.mark_chunk_rejected(peer, bin);
            }
        }
    }

    /// Publishes a [SwarmEvent::DataAvailable] for the chunks that completed the contiguous
    ///  verified prefix since the last call.
    pub fn publish_complete_bins(&mut self) {
        while let Some(address) = self.scheduler.get_new_complete_bins() {
            match self.chunk_buffer.read(&address) {
                Some(chunks) => {
                    debug!("chunks {}..={} are available", address.start_chunk(), address.end_chunk());
                    self.notifier.send_event(SwarmEvent::DataAvailable(DataAvailableData { address, chunks }));
                }
                None => warn!("completed chunks {:?} are no longer buffered", address),
            }
        }
    }

    /// Runs one scheduling cycle for a peer and queues the resulting messages. Returns when the
    ///  next cycle is due, or `None` for an unknown peer.
    pub fn run_peer(&mut self, id: PeerId, now: Instant) -> Option<Instant> {
        let cycle = self.scheduler.run_peer_cycle(id, now)?;
        let peer = self.peers.get_mut(&id)?;
        if !peer.is_ready() {
            return Some(cycle.next_run);
        }

        for address in cycle.cancels {
            peer.push(Message::Cancel(address));
        }
        for address in cycle.requests {
            peer.push(Message::Request(address));
        }

        let timestamp = Timestamp::since(self.epoch, now);
        for bin in cycle.sends {
            let Some(data) = self.chunk_buffer.get(bin) else {
                warn!("chunk {} for {} is no longer buffered", bin, id);
                continue;
            };
            for message in self.integrity.integrity_messages(bin, peer.known_hashes_mut()) {
                peer.push(message);
            }
            peer.push(Message::Data(DataMessage { address: Address::from_bin(bin), timestamp, data }));
        }

        if let Some(oldest) = self.scheduler.window_start() {
            peer.prune_known_hashes(oldest);
        }
        Some(cycle.next_run)
    }

    /// Publishes freshly produced chunks. Each chunk may be up to the chunk size, and the batch
    ///  is padded with empty chunks to a power of two so it forms one signed subtree.
    pub fn inject(&mut self, chunks: Vec<Bytes>, now: Instant) -> anyhow::Result<Address> {
        if !self.can_publish {
            bail!("swarm {} has no signing key - cannot inject chunks", self.config.uri);
        }
        if chunks.is_empty() {
            bail!("no chunks to inject");
        }
        let chunk_size: usize = self.config.uri.chunk_size.safe_cast();
        if let Some(chunk) = chunks.iter().find(|c| c.len() > chunk_size) {
            bail!("chunk of {} bytes exceeds the chunk size {}", chunk.len(), chunk_size);
        }

        let mut chunks = chunks;
        chunks.resize(chunks.len().next_power_of_two(), Bytes::new());

        let address = self.integrity.append_subtree(&chunks, Timestamp::since(self.epoch, now))?;
        self.chunk_buffer.set_range(&address, &chunks);
        for (target, have) in self.scheduler.mark_chunks_loaded(&address) {
            self.push_to(target, Message::Have(have));
        }

        debug!("injected chunks {}..={}", address.start_chunk(), address.end_chunk());
        Ok(address)
    }

    /// Serializes every peer's queued messages into datagrams
    pub fn flush(&mut self) -> Vec<(PeerId, Vec<Bytes>)> {
        let mut result = Vec::new();
        for id in self.peer_ids() {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            let messages = peer.take_outbox();
            if messages.is_empty() {
                continue;
            }

            let mut builder = DatagramBuilder::new(&self.codec, peer.remote_channel_id().unwrap_or(0), self.config.max_datagram_size);
            for message in messages {
                builder.push(message);
            }
            result.push((id, builder.finish()));
        }
        result
    }

    fn push_to(&mut self, id: PeerId, message: Message) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.push(message);
        }
    }
}

fn ack(bin: Bin, delay_sample: Timestamp) -> Message {
    Message::Ack(AckMessage {
        address: Address::from_bin(bin),
        delay_sample,
    })
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::swarm::PeerConnectionState;
    use crate::test_util::{test_chunks, test_config, test_keys, SwarmPair};
    use std::time::Duration;

    fn decode(swarm: &Swarm, datagram: &Bytes) -> Datagram {
        Datagram::try_deser(swarm.codec(), &mut datagram.clone()).unwrap()
    }

    fn flushed_messages(swarm: &mut Swarm) -> Vec<Message> {
        let mut result = Vec::new();
        for (_, datagrams) in swarm.flush() {
            for datagram in datagrams {
                result.extend(decode(swarm, &datagram).messages);
            }
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_inject_pads_to_subtree() {
        let now = Instant::now();
        let mut swarm: Swarm = Swarm::new(test_config(1024, 64), &test_keys(), now).unwrap();
        let mut events = swarm.subscribe();

        let chunks = test_chunks(3, 1024, 0);
        let address = swarm.inject(chunks.clone(), now).unwrap();
        assert_eq!(address, Address::from_chunk_range(0, 3));
        assert_eq!(swarm.read(&Address::from_chunk_range(0, 2)), Some(chunks));
        assert_eq!(swarm.read(&Address::chunk(3)), Some(vec![Bytes::new()]));
        assert_eq!(swarm.scheduler().loaded_ranges(), vec![address]);

        swarm.publish_complete_bins();
        match events.try_recv().unwrap() {
            SwarmEvent::DataAvailable(data) => {
                assert_eq!(data.address, address);
                assert_eq!(data.chunks.len(), 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());

        assert_eq!(swarm.inject(test_chunks(4, 1024, 1), now).unwrap(), Address::from_chunk_range(4, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_and_padding_chunks_are_delivered() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();

        // a short chunk followed by a full one, padded with an empty chunk
        let chunks = vec![
            Bytes::from(vec![3u8; 10]),
            test_chunks(1, 1024, 2).remove(0),
            Bytes::from(vec![4u8; 1024]),
        ];
        let address = pair.seeder.inject(chunks.clone(), now).unwrap();
        assert_eq!(address, Address::from_chunk_range(0, 3));

        pair.deliver(now);
        for _ in 0..3 {
            pair.run_cycles(now);
            pair.deliver(now);
        }

        assert_eq!(pair.leecher.stats().integrity_errors, 0);
        assert_eq!(pair.leecher.stats().decode_errors, 0);
        assert_eq!(pair.leecher.scheduler().loaded_ranges(), vec![address]);
        let mut expected = chunks;
        expected.push(Bytes::new());
        assert_eq!(pair.leecher.read(&address), Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inject_rejects_invalid_chunks() {
        let now = Instant::now();
        let keys = test_keys();
        let mut swarm: Swarm = Swarm::new(test_config(1024, 64), &keys, now).unwrap();
        assert!(swarm.inject(vec![], now).is_err());
        assert!(swarm.inject(vec![Bytes::from(vec![0u8; 1025])], now).is_err());

        let mut consumer: Swarm = Swarm::new(test_config(1024, 64), &SwarmKeys::public(keys.swarm_id.clone()), now).unwrap();
        assert!(consumer.inject(test_chunks(1, 1024, 0), now).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_announces_loaded_chunks() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();
        pair.seeder.inject(test_chunks(4, 1024, 0), now).unwrap();

        pair.deliver(now);
        assert_eq!(pair.leecher.peer(pair.leecher_side).unwrap().state(), PeerConnectionState::Ready);
        assert_eq!(pair.seeder.peer(pair.seeder_side).unwrap().state(), PeerConnectionState::Ready);
        assert_eq!(pair.leecher.peer(pair.leecher_side).unwrap().remote_channel_id(), Some(pair.seeder_side.0));
        assert!(pair.leecher.scheduler().peer(pair.leecher_side).unwrap().is_ready());

        let seeder_availability = pair.leecher.scheduler().peer(pair.leecher_side).unwrap().availability().ranges();
        assert_eq!(seeder_availability, vec![Address::from_chunk_range(0, 3)]);

        // chunks injected later are announced right away
        pair.seeder.inject(test_chunks(4, 1024, 1), now).unwrap();
        pair.deliver(now);
        let seeder_availability = pair.leecher.scheduler().peer(pair.leecher_side).unwrap().availability().ranges();
        assert_eq!(seeder_availability, vec![Address::from_chunk_range(0, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_handshake_closes_peer() {
        let now = Instant::now();
        let keys = test_keys();
        let mut seeder: Swarm = Swarm::new(test_config(1024, 64), &keys, now).unwrap();
        let mut leecher: Swarm = Swarm::new(test_config(2048, 64), &SwarmKeys::public(keys.swarm_id.clone()), now).unwrap();
        let mut events = seeder.subscribe();

        let leecher_side = leecher.add_peer(true, now).unwrap();
        let seeder_side = seeder.add_peer(false, now).unwrap();
        assert_eq!(events.try_recv().unwrap(), SwarmEvent::PeerAdded(PeerAddedData { peer: seeder_side, initiator: false }));

        let (peer, datagrams) = leecher.flush().pop().unwrap();
        assert_eq!(peer, leecher_side);
        for datagram in datagrams {
            assert!(seeder.handle_datagram(seeder_side, datagram, now).is_empty());
        }

        assert!(!seeder.has_peer(seeder_side));
        assert!(seeder.scheduler().peer(seeder_side).is_none());
        assert_eq!(seeder.take_closed_peers(), vec![seeder_side]);
        assert!(seeder.take_closed_peers().is_empty());
        assert_eq!(seeder.stats().protocol_errors, 1);
        assert_eq!(events.try_recv().unwrap(), SwarmEvent::PeerRemoved(PeerRemovedData { peer: seeder_side }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_datagrams_are_dropped() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();
        let seeder_side = pair.seeder_side;

        pair.seeder.handle_datagram(seeder_side, Bytes::from_static(&[1, 2, 3]), now);
        assert_eq!(pair.seeder.stats().decode_errors, 1);

        let misdirected = Datagram { channel_id: 77, messages: vec![Message::Choke] }.to_bytes(pair.seeder.codec());
        pair.seeder.handle_datagram(seeder_side, misdirected, now);
        assert_eq!(pair.seeder.stats().misdirected_datagrams, 1);

        let premature = Datagram { channel_id: seeder_side.0, messages: vec![Message::Have(Address::chunk(0))] }.to_bytes(pair.seeder.codec());
        pair.seeder.handle_datagram(seeder_side, premature, now);
        assert_eq!(pair.seeder.stats().messages_before_handshake, 1);
        assert_eq!(pair.seeder.stats().protocol_errors, 1);
        assert!(!pair.seeder.scheduler().peer(seeder_side).unwrap().availability().get(0));

        assert!(pair.seeder.has_peer(seeder_side));
        assert_eq!(pair.seeder.stats().datagrams_received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_choke_and_unchoke() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();
        pair.deliver(now);

        let leecher_side = pair.leecher_side;
        let choke = Datagram { channel_id: leecher_side.0, messages: vec![Message::Choke] }.to_bytes(pair.leecher.codec());
        pair.leecher.handle_datagram(leecher_side, choke, now);
        assert_eq!(pair.leecher.peer(leecher_side).unwrap().state(), PeerConnectionState::Choked);
        assert!(pair.leecher.scheduler().peer(leecher_side).unwrap().is_choked());

        let unchoke = Datagram { channel_id: leecher_side.0, messages: vec![Message::Unchoke] }.to_bytes(pair.leecher.codec());
        pair.leecher.handle_datagram(leecher_side, unchoke, now);
        assert_eq!(pair.leecher.peer(leecher_side).unwrap().state(), PeerConnectionState::Ready);
        assert!(!pair.leecher.scheduler().peer(leecher_side).unwrap().is_choked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_chunk_is_rejected_and_requested_again() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();
        pair.seeder.inject(test_chunks(2, 1024, 0), now).unwrap();
        pair.deliver(now);

        pair.leecher.run_peer(pair.leecher_side, now);
        pair.deliver(now);
        pair.seeder.run_peer(pair.seeder_side, now);

        let mut jobs = Vec::new();
        for (_, datagrams) in pair.seeder.flush() {
            for datagram in datagrams {
                let mut datagram = decode(&pair.seeder, &datagram);
                for message in datagram.messages.iter_mut() {
                    if let Message::Data(data) = message {
                        if data.address == Address::chunk(0) {
                            let mut corrupted = data.data.to_vec();
                            corrupted[0] ^= 0xff;
                            data.data = Bytes::from(corrupted);
                        }
                    }
                }
                let bytes = datagram.to_bytes(pair.seeder.codec());
                jobs.extend(pair.leecher.handle_datagram(pair.leecher_side, bytes, now));
            }
        }
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            pair.leecher.complete_verification(job.run());
        }

        assert_eq!(pair.leecher.stats().integrity_errors, 1);
        assert_eq!(pair.leecher.stats().chunks_verified, 1);
        assert_eq!(pair.leecher.scheduler().loaded_ranges(), vec![Address::chunk(1)]);
        assert!(pair.leecher.scheduler().chunk_state(0).unwrap().is_requestable());
        assert_eq!(pair.leecher.read(&Address::chunk(0)), None);

        // only the good chunk was acknowledged
        let acks = flushed_messages(&mut pair.leecher).into_iter()
            .filter(|m| matches!(m, Message::Ack(_)))
            .collect::<Vec<_>>();
        assert_eq!(acks.len(), 1);

        let later = now + Duration::from_millis(100);
        pair.leecher.run_peer(pair.leecher_side, later);
        let requests = flushed_messages(&mut pair.leecher);
        assert!(requests.contains(&Message::Request(Address::chunk(0))), "{:?}", requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_peer_notifies_remote() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(1024, 64), now).unwrap();
        pair.deliver(now);

        let close = pair.leecher.remove_peer(pair.leecher_side, true);
        assert_eq!(close.len(), 1);
        assert!(!pair.leecher.has_peer(pair.leecher_side));
        assert!(pair.leecher.flush().is_empty());
        // removing by request of the caller is not reported as closed by the swarm
        assert!(pair.leecher.take_closed_peers().is_empty());

        pair.seeder.handle_datagram(pair.seeder_side, close[0].clone(), now);
        assert!(!pair.seeder.has_peer(pair.seeder_side));
        assert_eq!(pair.seeder.take_closed_peers(), vec![pair.seeder_side]);
        assert_eq!(pair.seeder.stats().protocol_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_unready_peer_sends_nothing() {
        let now = Instant::now();
        let mut swarm: Swarm = Swarm::new(test_config(1024, 64), &test_keys(), now).unwrap();
        let id = swarm.add_peer(true, now).unwrap();
        assert!(swarm.remove_peer(id, true).is_empty());
        assert!(swarm.remove_peer(id, true).is_empty());
    }
}
