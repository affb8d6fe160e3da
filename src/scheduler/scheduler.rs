use crate::addressing::{chunk_to_bin, Address, Bin};
use crate::availability::AvailabilityMap;
use crate::scheduler::{ChunkState, PeerId, PeerState, SchedulerConfig};
use crate::util::random::{Random, RngRandom};
use crate::util::ring_buffer::BinRingBuffer;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wfq::{FlowId, WeightedFairQueue};
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use std::iter::StepBy;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// the chunk is new and must be verified before it counts as received
    Accepted,
    /// the chunk was received (or loaded) before
    Duplicate,
    /// the chunk is older than anything in the live window
    Stale,
}

/// What a peer's scheduling cycle decided. Ranges and bins are in ascending order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerCycle {
    /// requests that timed out or fell out of the window
    pub cancels: Vec<Address>,
    pub requests: Vec<Address>,
    /// chunks to send to the peer now
    pub sends: Vec<Bin>,
    pub next_run: Instant,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SchedulerStats {
    pub chunks_requested: u64,
    pub chunks_sent: u64,
    pub duplicate_chunks: u64,
    pub stale_chunks: u64,
    pub rejected_chunks: u64,
    pub request_timeouts: u64,
    /// ACKs for chunks that were not sent or were acked before
    pub ack_unknown: u64,
    /// CANCELs for chunks that were neither queued nor sent
    pub cancel_unknown: u64,
    /// chunks requested from us that we do not have
    pub requests_for_missing: u64,
}


/// Per-swarm request and upload scheduling.
///
/// Downloading: every peer runs a periodic cycle that requests chunks the peer has and nobody
///  was asked for yet, as many as the peer is expected to deliver within the planning horizon.
///  Chunks close to the completion cursor are requested from every peer that has them in
///  turn; chunks further out are requested only with some probability per cycle so that
///  requests spread across peers.
///
/// Uploading: chunk requests from all peers go through a weighted fair queue, and each peer's
///  cycle sends as much as its LEDBAT window allows.
///
/// Completion: the scheduler tracks the first chunk that is not verified yet. Everything
///  before it is complete and gets exported exactly once.
pub struct Scheduler<R: Random = RngRandom> {
    config: Arc<SchedulerConfig>,
    epoch: Instant,
    peers: FxHashMap<PeerId, PeerState>,
    chunks: BinRingBuffer<ChunkState>,
    loaded: AvailabilityMap,
    upload_queue: WeightedFairQueue<Bin>,
    /// first chunk bin that is not verified, once the first chunk was requested or loaded
    next_completion: Option<Bin>,
    /// first chunk bin that was not exported yet
    next_export: Option<Bin>,
    stats: SchedulerStats,
    _random: PhantomData<fn() -> R>,
}

impl <R: Random> Scheduler<R> {
    pub fn new(config: Arc<SchedulerConfig>, now: Instant) -> anyhow::Result<Scheduler<R>> {
        config.validate()?;

        let capacity = config.window_capacity();
        Ok(Scheduler {
            epoch: now,
            peers: FxHashMap::default(),
            chunks: BinRingBuffer::new(capacity.prechecked_cast()),
            loaded: AvailabilityMap::new(capacity),
            upload_queue: WeightedFairQueue::new(config.upload_rate),
            next_completion: None,
            next_export: None,
            stats: SchedulerStats::default(),
            config,
            _random: PhantomData,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerState> {
        self.peers.get(&peer)
    }

    /// registered peers in ascending order
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut result = self.peers.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn chunk_state(&self, bin: Bin) -> Option<&ChunkState> {
        self.chunks.get(bin)
    }

    /// chunks that are verified locally
    pub fn loaded(&self) -> &AvailabilityMap {
        &self.loaded
    }

    pub fn loaded_ranges(&self) -> Vec<Address> {
        self.loaded.ranges()
    }

    /// the oldest chunk bin inside the live window
    pub fn window_start(&self) -> Option<Bin> {
        self.chunks.oldest_bin()
    }

    /// the last chunk bin of the contiguously verified prefix, if any
    pub fn last_completed_bin(&self) -> Option<Bin> {
        self.next_completion
            .and_then(|bin| bin.checked_sub(2))
    }

    pub fn add_peer(&mut self, peer: PeerId, now: Instant) -> anyhow::Result<()> {
        if self.peers.contains_key(&peer) {
            bail!("{} is already registered", peer);
        }
        let flow = self.upload_queue.add_flow();
        self.peers.insert(peer, PeerState::new(peer, flow, &self.config, now));
        debug!("added {}", peer);
        Ok(())
    }

    /// Marks a peer's handshake as complete. Returns false for unknown peers.
    pub fn set_peer_ready(&mut self, peer: PeerId, now: Instant) -> bool {
        match self.peers.get_mut(&peer) {
            Some(state) => {
                state.ready = true;
                state.next_run = now;
                true
            }
            None => false,
        }
    }

    /// A peer that chokes us discards our requests, so they are released for other peers
    pub fn set_peer_choked(&mut self, peer: PeerId, choked: bool, now: Instant) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        state.choked = choked;
        if choked {
            for bin in state.requests.clear() {
                release_request(&mut self.chunks, peer, bin);
            }
        }
        else {
            state.next_run = now;
        }
    }

    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        let Some(mut state) = self.peers.remove(&peer) else {
            return false;
        };

        for bin in state.requests.clear() {
            release_request(&mut self.chunks, peer, bin);
        }
        for chunk_index in state.availability.to_value_array() {
            if let Some(chunk) = self.chunks.get_mut(chunk_to_bin(chunk_index)) {
                chunk.available_count = chunk.available_count.saturating_sub(1);
            }
        }
        let dropped = self.upload_queue.remove_flow(state.flow);
        debug!("removed {}, dropping {} queued uploads", peer, dropped);
        true
    }

    /// Registers chunks a peer has. Returns the number of chunks that were not known to be
    ///  available at the peer before.
    pub fn mark_chunk_available(&mut self, peer: PeerId, address: &Address) -> usize {
        let Some(state) = self.peers.get_mut(&peer) else {
            return 0;
        };
        let new_bins = state.availability.set_new(address);
        for &bin in &new_bins {
            if let Some(chunk) = self.chunks.get_or_advance(bin) {
                chunk.available_count += 1;
            }
        }
        trace!("{} has {:?}: {} new chunks", peer, address, new_bins.len());
        new_bins.len()
    }

    pub fn mark_chunk_received(&mut self, peer: PeerId, bin: Bin, num_bytes: u64, now: Instant) -> ReceiveOutcome {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.on_chunk_received(bin, num_bytes, now);
        }

        let Some(chunk) = self.chunks.get_or_advance(bin) else {
            self.stats.stale_chunks += 1;
            return ReceiveOutcome::Stale;
        };
        if chunk.verifying || chunk.verified {
            self.stats.duplicate_chunks += 1;
            return ReceiveOutcome::Duplicate;
        }

        chunk.received = true;
        chunk.verifying = true;
        chunk.clear_request();
        ReceiveOutcome::Accepted
    }

    /// Marks a received chunk as verified. Returns the ready peers that should be told about
    ///  it with a HAVE.
    pub fn mark_chunk_verified(&mut self, bin: Bin) -> Vec<(PeerId, Address)> {
        let Some(chunk) = self.chunks.get_mut(bin) else {
            debug!("verified chunk {} fell out of the live window", bin);
            return Vec::new();
        };
        chunk.verifying = false;
        chunk.verified = true;
        chunk.clear_request();

        let address = Address::from_bin(bin);
        self.loaded.set(&address, true);
        self.seed_completion(bin);
        self.advance_completion();
        self.have_targets(&address)
    }

    /// A received chunk failed verification: it becomes requestable again
    pub fn mark_chunk_rejected(&mut self, peer: PeerId, bin: Bin) {
        if let Some(chunk) = self.chunks.get_mut(bin) {
            chunk.verifying = false;
            chunk.received = false;
            chunk.clear_request();
        }
        if let Some(state) = self.peers.get_mut(&peer) {
            state.stats.invalid_chunks += 1;
        }
        self.stats.rejected_chunks += 1;
    }

    /// Registers locally produced chunks (injected at a seeder). Returns the ready peers that
    ///  should be told about them with a HAVE.
    pub fn mark_chunks_loaded(&mut self, address: &Address) -> Vec<(PeerId, Address)> {
        for bin in window_bins(address, self.config.window_capacity()) {
            if let Some(chunk) = self.chunks.get_or_advance(bin) {
                chunk.verifying = false;
                chunk.verified = true;
                chunk.clear_request();
            }
        }
        self.loaded.set(address, true);
        self.seed_completion(address.start);
        self.advance_completion();
        self.have_targets(address)
    }

    /// Queues chunks a peer requested from us. Returns the number of chunks queued; chunks we
    ///  do not have are skipped.
    pub fn enqueue_request(&mut self, peer: PeerId, address: &Address, now: Instant) -> usize {
        let Some(state) = self.peers.get_mut(&peer) else {
            return 0;
        };
        let chunk_size: u64 = self.config.chunk_size.safe_cast();
        let now_secs = now.saturating_duration_since(self.epoch).as_secs_f64();

        let mut queued = 0;
        for bin in window_bins(address, self.config.window_capacity()) {
            if !self.loaded.get(bin) {
                self.stats.requests_for_missing += 1;
                continue;
            }
            match self.upload_queue.enqueue(state.flow, chunk_size, bin, now_secs) {
                Ok(()) => queued += 1,
                Err(e) => warn!("could not queue chunk {} for {}: {}", bin, peer, e),
            }
        }
        if queued > 0 {
            state.next_run = state.next_run.min(now);
        }
        queued
    }

    /// A peer withdrew requests. Queued chunks are dropped; chunks that were sent already count
    ///  as lost.
    pub fn cancel_request(&mut self, peer: PeerId, address: &Address, now: Instant) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        let chunk_size: u64 = self.config.chunk_size.safe_cast();

        for bin in window_bins(address, self.config.window_capacity()) {
            if self.upload_queue.remove(state.flow, &bin) {
                continue;
            }
            if state.unacked_sends.remove(&bin).is_some() {
                let rtt = Duration::from_secs_f64(state.rtt_ms(&self.config) / 1000.0);
                state.ledbat.on_data_loss(chunk_size, false, rtt, now);
                continue;
            }
            self.stats.cancel_unknown += 1;
        }
    }

    /// A peer acknowledged chunks we sent, reporting the one-way delay it measured
    pub fn mark_send_acked(&mut self, peer: PeerId, address: &Address, delay_ms: f64, now: Instant) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        let chunk_size: u64 = self.config.chunk_size.safe_cast();

        for bin in window_bins(address, self.config.window_capacity()) {
            match state.unacked_sends.remove(&bin) {
                Some(_) => {
                    state.ledbat.add_delay_sample(delay_ms, chunk_size, now);
                    state.stats.chunks_acked += 1;
                }
                None => self.stats.ack_unknown += 1,
            }
        }
        state.sent.set(address, true);

        // an ack implies that the peer has the chunks now
        self.mark_chunk_available(peer, address);
    }

    /// Runs one scheduling cycle for a peer. Returns `None` for unknown peers.
    pub fn run_peer_cycle(&mut self, peer: PeerId, now: Instant) -> Option<PeerCycle> {
        if !self.peers.contains_key(&peer) {
            return None;
        }

        self.advance_completion();
        let cancels = self.expire_requests(peer, now);
        let requests = self.plan_requests(peer, now);
        let sends = self.plan_sends(peer, now);
        self.check_sends(peer, now);
        let next_run = self.schedule_next_run(peer, now);

        Some(PeerCycle {
            cancels,
            requests,
            sends,
            next_run,
        })
    }

    /// Returns the range of chunks that became contiguously complete since the last call
    pub fn get_new_complete_bins(&mut self) -> Option<Address> {
        let (Some(next_completion), Some(next_export)) = (self.next_completion, self.next_export) else {
            return None;
        };
        if next_completion <= next_export {
            return None;
        }
        self.next_export = Some(next_completion);
        Some(Address::from_range(next_export, next_completion - 2))
    }

    fn seed_completion(&mut self, first_bin: Bin) {
        if self.next_completion.is_none() {
            debug!("starting at chunk bin {}", first_bin);
            self.next_completion = Some(first_bin);
            self.next_export = Some(first_bin);
        }
    }

    /// Moves the completion cursor across verified chunks. If the cursor fell out of the live
    ///  window, the chunks it was waiting for are gone for good and it skips ahead.
    fn advance_completion(&mut self) {
        let Some(mut next) = self.next_completion else {
            return;
        };
        if let Some(oldest) = self.chunks.oldest_bin() {
            if next < oldest {
                debug!("chunks {}..{} fell out of the live window unverified - skipping", next, oldest);
                next = oldest;
                if self.next_export.is_some_and(|bin| bin < oldest) {
                    self.next_export = Some(oldest);
                }
            }
        }
        while self.chunks.get(next).is_some_and(|chunk| chunk.verified) {
            next += 2;
        }
        self.next_completion = Some(next);
    }

    fn have_targets(&self, address: &Address) -> Vec<(PeerId, Address)> {
        self.peer_ids().into_iter()
            .filter_map(|id| self.peers.get(&id))
            .filter(|state| state.ready)
            .filter(|state| !address.chunk_bins().all(|bin| state.availability.get(bin)))
            .map(|state| (state.id, *address))
            .collect()
    }

    fn expire_requests(&mut self, peer: PeerId, now: Instant) -> Vec<Address> {
        let Some(state) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };

        let timeout = 2 * self.config.max_request_timeout.min(state.ledbat.cto());
        let timed_out = match now.checked_sub(timeout) {
            Some(deadline) => state.requests.drain_sent_before(deadline),
            None => Vec::new(),
        };
        let mut expired = match self.chunks.oldest_bin() {
            Some(oldest) => state.requests.drain_below(oldest),
            None => Vec::new(),
        };

        if !timed_out.is_empty() {
            debug!("{}: {} requests timed out after {:?}", peer, timed_out.len(), timeout);
            let num_timed_out: u64 = timed_out.len().prechecked_cast();
            state.stats.request_timeouts += num_timed_out;
            self.stats.request_timeouts += num_timed_out;

            // requested chunks are not part of our flight size
            let rtt = Duration::from_secs_f64(state.rtt_ms(&self.config) / 1000.0);
            state.ledbat.on_data_loss(0, true, rtt, now);
        }

        expired.extend(timed_out);
        expired.sort();
        for &bin in &expired {
            release_request(&mut self.chunks, peer, bin);
        }
        collapse_ranges(&expired)
    }

    fn plan_requests(&mut self, peer: PeerId, now: Instant) -> Vec<Address> {
        let config = self.config.clone();
        let Some(state) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };
        if !state.ready || state.choked {
            return Vec::new();
        }
        let (Some(peer_min), Some(peer_max)) = (state.availability.min(), state.availability.max()) else {
            return Vec::new();
        };

        let horizon_ms = (config.min_planning_horizon.as_secs_f64() * 1000.0)
            .max(4.0 * state.rtt_ms(&config));
        let expected_chunks = (horizon_ms / state.chunk_interval_ms(&config))
            .floor()
            .min(config.window_capacity() as f64) as usize;
        let budget = expected_chunks.max(1)
            .saturating_sub(state.requests.len());
        if budget == 0 {
            return Vec::new();
        }

        let mut start = peer_min;
        if let Some(oldest) = self.chunks.oldest_bin() {
            start = start.max(oldest);
        }
        if let Some(next) = self.next_completion {
            start = start.max(next);
        }
        let end = peer_max.min(start + 2 * (u64::from(config.live_discard_window) - 1));
        let priority_base = self.next_completion.unwrap_or(start);

        let mut selected = Vec::new();
        if start <= end {
            for bin in (start..=end).step_by(2) {
                if selected.len() >= budget {
                    break;
                }
                if self.loaded.get(bin) || !state.availability.get(bin) {
                    continue;
                }
                let Some(chunk) = self.chunks.get_mut(bin) else {
                    continue;
                };
                if !chunk.is_requestable() {
                    continue;
                }

                let urgent = bin.saturating_sub(priority_base) < config.priority_bin_threshold;
                if !urgent && R::gen_f64_range(0.0..1.0) >= config.non_priority_request_probability {
                    continue;
                }

                chunk.requested = true;
                chunk.requested_at = Some(now);
                chunk.requested_by = Some(peer);
                state.requests.insert(bin, now);
                selected.push(bin);
            }
        }

        if let Some(&first) = selected.first() {
            self.seed_completion(first);
        }
        let num_selected: u64 = selected.len().prechecked_cast();
        self.stats.chunks_requested += num_selected;
        collapse_ranges(&selected)
    }

    fn plan_sends(&mut self, peer: PeerId, now: Instant) -> Vec<Bin> {
        let chunk_size: u64 = self.config.chunk_size.safe_cast();
        let eligible = self.peers.values()
            .filter(|state| state.ready && state.ledbat.can_send())
            .map(|state| state.flow)
            .collect::<FxHashSet<FlowId>>();

        let Some(state) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };
        if !state.ready {
            return Vec::new();
        }

        let mut sends = Vec::new();
        while state.ledbat.can_send() {
            let Some(bin) = self.upload_queue.dequeue_if_first(state.flow, |flow| eligible.contains(&flow)) else {
                break;
            };
            if !self.loaded.get(bin) {
                // fell out of the window while queued
                self.stats.requests_for_missing += 1;
                continue;
            }
            state.unacked_sends.insert(bin, now);
            state.ledbat.on_data_sent(chunk_size);
            state.send_rate.add(now, chunk_size);
            state.stats.chunks_sent += 1;
            sends.push(bin);
        }
        let num_sends: u64 = sends.len().prechecked_cast();
        self.stats.chunks_sent += num_sends;
        sends
    }

    /// Sends that stayed unacknowledged for too long count as lost, then the ack timeout is checked
    fn check_sends(&mut self, peer: PeerId, now: Instant) {
        let chunk_size: u64 = self.config.chunk_size.safe_cast();
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };

        if let Some(deadline) = now.checked_sub(2 * state.ledbat.cto()) {
            let lost = state.unacked_sends.iter()
                .filter(|(_, &sent_at)| sent_at < deadline)
                .map(|(&bin, _)| bin)
                .collect::<Vec<_>>();
            if !lost.is_empty() {
                debug!("{}: {} sent chunks were never acknowledged", peer, lost.len());
            }
            let rtt = Duration::from_secs_f64(state.rtt_ms(&self.config) / 1000.0);
            for bin in lost {
                state.unacked_sends.remove(&bin);
                state.ledbat.on_data_loss(chunk_size, false, rtt, now);
            }
        }

        state.ledbat.check_acks(now);
    }

    /// A peer's cycle runs once per round trip divided by the number of chunks that fit
    ///  into the congestion window, within the configured bounds
    fn schedule_next_run(&mut self, peer: PeerId, now: Instant) -> Instant {
        let config = &self.config;
        let Some(state) = self.peers.get_mut(&peer) else {
            return now + config.max_loop_interval;
        };

        let chunk_size: f64 = config.chunk_size.safe_cast();
        let cwnd_chunks = (state.ledbat.cwnd() / chunk_size).max(1.0);
        let interval_ms = (state.rtt_ms(config) / cwnd_chunks)
            .min(config.max_loop_interval.as_secs_f64() * 1000.0)
            .max(config.min_loop_interval.as_secs_f64() * 1000.0);

        state.next_run = now + Duration::from_secs_f64(interval_ms / 1000.0);
        state.next_run
    }
}

fn release_request(chunks: &mut BinRingBuffer<ChunkState>, peer: PeerId, bin: Bin) {
    if let Some(chunk) = chunks.get_mut(bin) {
        if chunk.requested_by == Some(peer) {
            chunk.clear_request();
        }
    }
}

/// the chunk bins of an address, limited to the last `capacity` chunks since nothing older
///  than that can be tracked
fn window_bins(address: &Address, capacity: u64) -> StepBy<RangeInclusive<Bin>> {
    let first = address.start
        .max(address.end.saturating_sub(2 * (capacity - 1)));
    (first..=address.end).step_by(2)
}

/// collapses ascending chunk bins into maximal contiguous ranges
pub(crate) fn collapse_ranges(bins: &[Bin]) -> Vec<Address> {
    let mut result = Vec::new();
    let mut current: Option<(Bin, Bin)> = None;
    for &bin in bins {
        current = match current {
            Some((start, end)) if end + 2 == bin => Some((start, bin)),
            Some((start, end)) => {
                result.push(Address::from_range(start, end));
                Some((bin, bin))
            }
            None => Some((bin, bin)),
        };
    }
    if let Some((start, end)) = current {
        result.push(Address::from_range(start, end));
    }
    result
}
