use anyhow::bail;
use std::time::Duration;


#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub chunk_size: u32,

    /// The number of chunks behind the newest one that are tracked and buffered. All
    ///  bin-indexed state is bounded by (a small multiple of) this.
    pub live_discard_window: u32,

    /// Bins closer than this to the completion cursor are urgent and always requested from
    ///  any peer that has them.
    pub priority_bin_threshold: u64,

    /// Bins further out are requested from a given peer with this probability per cycle,
    ///  which spreads non-urgent requests across peers instead of asking all of them for
    ///  the same chunks.
    pub non_priority_request_probability: f64,

    /// The assumed spacing of chunks from a peer before the first chunk was measured. This
    ///  bounds how many requests go out in the very first cycle.
    pub initial_chunk_interval: Duration,

    /// request-to-receive latency assumed before the first measurement
    pub initial_rtt: Duration,

    pub min_loop_interval: Duration,
    pub max_loop_interval: Duration,

    /// requests are planned to cover at least this much time
    pub min_planning_horizon: Duration,

    /// upper bound for half the request timeout; the timeout is `2 * min(this, cto)`
    pub max_request_timeout: Duration,

    /// upload bandwidth shared between requesting peers, in bytes per second
    pub upload_rate: f64,

    /// weight of new samples in the per-peer moving averages
    pub ema_alpha: f64,
}

impl SchedulerConfig {
    pub fn new(chunk_size: u32, live_discard_window: u32) -> SchedulerConfig {
        SchedulerConfig {
            chunk_size,
            live_discard_window,
            priority_bin_threshold: 64,
            non_priority_request_probability: 0.1,
            initial_chunk_interval: Duration::from_millis(10),
            initial_rtt: Duration::from_millis(100),
            min_loop_interval: Duration::from_millis(10),
            max_loop_interval: Duration::from_millis(1000),
            min_planning_horizon: Duration::from_millis(1000),
            max_request_timeout: Duration::from_millis(1000),
            upload_rate: 10_000_000.0,
            ema_alpha: 0.125,
        }
    }

    /// number of chunks tracked in bin-indexed state
    pub fn window_capacity(&self) -> u64 {
        2 * self.live_discard_window as u64
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.live_discard_window == 0 {
            bail!("live discard window must be positive");
        }
        if !(0.0..=1.0).contains(&self.non_priority_request_probability) {
            bail!("non-priority request probability must be between 0 and 1, was {}", self.non_priority_request_probability);
        }
        if self.min_loop_interval.is_zero() || self.min_loop_interval > self.max_loop_interval {
            bail!("loop interval bounds {:?}..{:?} are invalid", self.min_loop_interval, self.max_loop_interval);
        }
        if self.initial_chunk_interval.is_zero() {
            bail!("initial chunk interval must be positive");
        }
        if self.upload_rate <= 0.0 {
            bail!("upload rate must be positive");
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            bail!("ema alpha must be in (0, 1], was {}", self.ema_alpha);
        }
        Ok(())
    }
}
