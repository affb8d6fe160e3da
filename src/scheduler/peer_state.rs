use crate::addressing::{Address, Bin};
use crate::availability::AvailabilityMap;
use crate::ledbat::Ledbat;
use crate::scheduler::{PeerId, SchedulerConfig};
use crate::util::rolling_data::{MovingAverage, RateMeter};
use crate::wfq::FlowId;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

const RATE_BUCKETS: usize = 10;
const RATE_GRANULARITY: Duration = Duration::from_millis(500);


/// Requests sent to a peer that were not answered yet, by chunk bin
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: BTreeMap<Bin, Instant>,
}
impl PendingRequests {
    pub fn insert(&mut self, bin: Bin, now: Instant) {
        self.requests.insert(bin, now);
    }

    /// returns the time the request was sent, if there was one
    pub fn remove(&mut self, bin: Bin) -> Option<Instant> {
        self.requests.remove(&bin)
    }

    pub fn contains(&self, bin: Bin) -> bool {
        self.requests.contains_key(&bin)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// removes and returns all requests sent before `deadline`, in ascending bin order
    pub fn drain_sent_before(&mut self, deadline: Instant) -> Vec<Bin> {
        let expired = self.requests.iter()
            .filter(|(_, &sent_at)| sent_at < deadline)
            .map(|(&bin, _)| bin)
            .collect::<Vec<_>>();
        for bin in &expired {
            self.requests.remove(bin);
        }
        expired
    }

    /// removes and returns all requests for bins below `bin`
    pub fn drain_below(&mut self, bin: Bin) -> Vec<Bin> {
        let retained = self.requests.split_off(&bin);
        let dropped = std::mem::replace(&mut self.requests, retained);
        dropped.into_keys().collect()
    }

    pub fn clear(&mut self) -> Vec<Bin> {
        std::mem::take(&mut self.requests).into_keys().collect()
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerStats {
    pub chunks_received: u64,
    pub chunks_sent: u64,
    pub chunks_acked: u64,
    pub invalid_chunks: u64,
    pub request_timeouts: u64,
}


/// Everything the scheduler tracks about one peer
pub struct PeerState {
    pub id: PeerId,
    pub(crate) flow: FlowId,
    /// the handshake completed, so requests and data may be exchanged
    pub(crate) ready: bool,
    /// the peer choked us: it discards our requests
    pub(crate) choked: bool,
    pub(crate) next_run: Instant,

    /// chunks the peer announced (HAVE) or acknowledged
    pub(crate) availability: AvailabilityMap,
    /// chunks we sent to the peer and that were acknowledged
    pub(crate) sent: AvailabilityMap,
    /// chunks we received from the peer
    pub(crate) received: AvailabilityMap,

    pub(crate) requests: PendingRequests,
    /// chunks we sent that were not acknowledged yet, with their send time
    pub(crate) unacked_sends: FxHashMap<Bin, Instant>,

    pub(crate) ledbat: Ledbat,
    /// request-to-receive latency in ms
    pub(crate) rtt: MovingAverage,
    /// spacing of received chunks in ms
    pub(crate) chunk_interval: MovingAverage,
    pub(crate) last_received_at: Option<Instant>,
    pub(crate) receive_rate: RateMeter,
    pub(crate) send_rate: RateMeter,

    pub stats: PeerStats,
}
impl PeerState {
    pub fn new(id: PeerId, flow: FlowId, config: &SchedulerConfig, now: Instant) -> PeerState {
        let capacity = config.window_capacity();
        PeerState {
            id,
            flow,
            ready: false,
            choked: false,
            next_run: now,
            availability: AvailabilityMap::new(capacity),
            sent: AvailabilityMap::new(capacity),
            received: AvailabilityMap::new(capacity),
            requests: PendingRequests::default(),
            unacked_sends: FxHashMap::default(),
            ledbat: Ledbat::new(now),
            rtt: MovingAverage::new(config.ema_alpha),
            chunk_interval: MovingAverage::new(config.ema_alpha),
            last_received_at: None,
            receive_rate: RateMeter::new(RATE_BUCKETS, RATE_GRANULARITY, now),
            send_rate: RateMeter::new(RATE_BUCKETS, RATE_GRANULARITY, now),
            stats: PeerStats::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn availability(&self) -> &AvailabilityMap {
        &self.availability
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.requests
    }

    pub fn ledbat(&self) -> &Ledbat {
        &self.ledbat
    }

    pub fn next_run(&self) -> Instant {
        self.next_run
    }

    /// request-to-receive latency in ms, falling back to the configured initial value
    pub fn rtt_ms(&self, config: &SchedulerConfig) -> f64 {
        self.rtt.value()
            .unwrap_or(config.initial_rtt.as_secs_f64() * 1000.0)
    }

    /// average spacing of received chunks in ms, falling back to the configured initial value
    pub fn chunk_interval_ms(&self, config: &SchedulerConfig) -> f64 {
        self.chunk_interval.value()
            .unwrap_or(config.initial_chunk_interval.as_secs_f64() * 1000.0)
    }

    pub fn receive_rate(&self, now: Instant) -> f64 {
        self.receive_rate.bytes_per_second(now)
    }

    pub fn send_rate(&self, now: Instant) -> f64 {
        self.send_rate.bytes_per_second(now)
    }

    pub(crate) fn on_chunk_received(&mut self, bin: Bin, num_bytes: u64, now: Instant) {
        if let Some(requested_at) = self.requests.remove(bin) {
            self.rtt.add_value(now.saturating_duration_since(requested_at).as_secs_f64() * 1000.0);
        }
        if let Some(prev) = self.last_received_at {
            self.chunk_interval.add_value(now.saturating_duration_since(prev).as_secs_f64() * 1000.0);
        }
        self.last_received_at = Some(now);
        self.receive_rate.add(now, num_bytes);
        self.received.set(&Address::from_bin(bin), true);
        self.stats.chunks_received += 1;
    }
}
