//! Low Extra Delay Background Transport (RFC 6817) congestion control.
//!
//! LEDBAT measures one-way delay and treats any delay above the lowest one seen recently as
//!  queuing delay. It grows the congestion window while queuing delay stays below a target and
//!  shrinks it proportionally above, so it yields to competing traffic before that traffic
//!  sees loss.

use crate::util::rolling_data::RollingMinimum;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// queuing delay LEDBAT aims for, in ms
pub const TARGET: f64 = 100.0;
pub const GAIN: f64 = 1.0;
/// the largest message a transport channel carries
pub const MSS: f64 = 65535.0;
pub const MIN_CWND: f64 = 2.0;
pub const INIT_CWND: f64 = 2.0;
pub const ALLOWED_INCREASE: f64 = 1.0;
/// in ms
pub const MIN_CTO: f64 = 1000.0;

const CURRENT_FILTER_BUCKETS: usize = 4;
const CURRENT_FILTER_GRANULARITY: Duration = Duration::from_secs(1);
const BASE_HISTORY_BUCKETS: usize = 10;
const BASE_HISTORY_GRANULARITY: Duration = Duration::from_secs(60);

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;


pub struct Ledbat {
    /// bytes
    cwnd: f64,
    /// bytes
    flight_size: f64,
    /// ms
    cto: f64,
    current_delays: RollingMinimum,
    base_delays: RollingMinimum,
    rtt_mean: Option<f64>,
    rtt_var: f64,
    last_ack_time: Instant,
    last_loss_time: Option<Instant>,
}
impl Ledbat {
    pub fn new(now: Instant) -> Ledbat {
        Ledbat {
            cwnd: INIT_CWND * MSS,
            flight_size: 0.0,
            cto: MIN_CTO,
            current_delays: RollingMinimum::new(CURRENT_FILTER_BUCKETS, CURRENT_FILTER_GRANULARITY, now),
            base_delays: RollingMinimum::new(BASE_HISTORY_BUCKETS, BASE_HISTORY_GRANULARITY, now),
            rtt_mean: None,
            rtt_var: 0.0,
            last_ack_time: now,
            last_loss_time: None,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn flight_size(&self) -> f64 {
        self.flight_size
    }

    pub fn cto(&self) -> Duration {
        Duration::from_secs_f64(self.cto / 1000.0)
    }

    /// smoothed queuing delay in ms, `None` before the first sample
    pub fn rtt_mean(&self) -> Option<f64> {
        self.rtt_mean
    }

    pub fn can_send(&self) -> bool {
        self.flight_size < self.cwnd
    }

    /// queuing delay in ms as the difference between the current and the base delay filter
    pub fn queuing_delay(&self, now: Instant) -> f64 {
        match (self.current_delays.min(now), self.base_delays.min(now)) {
            (Some(current), Some(base)) => current - base,
            _ => 0.0,
        }
    }

    pub fn on_data_sent(&mut self, bytes: u64) {
        self.flight_size += bytes as f64;
    }

    /// `delay_sample` is the one-way delay in ms reported for `bytes` acknowledged bytes
    pub fn add_delay_sample(&mut self, delay_sample: f64, bytes: u64, now: Instant) {
        let bytes = bytes as f64;
        self.current_delays.add_value(now, delay_sample);
        self.base_delays.add_value(now, delay_sample);

        let queuing_delay = self.queuing_delay(now);
        let off_target = (TARGET - queuing_delay) / TARGET;

        self.cwnd += GAIN * off_target * bytes * MSS / self.cwnd;
        let max_allowed_cwnd = self.flight_size + ALLOWED_INCREASE * MSS;
        self.cwnd = self.cwnd
            .min(max_allowed_cwnd)
            .max(MIN_CWND * MSS);

        self.flight_size = (self.flight_size - bytes).max(0.0);
        self.update_rtt(queuing_delay);
        self.last_ack_time = now;

        trace!(queuing_delay, off_target, cwnd = self.cwnd, flight_size = self.flight_size, "delay sample");
    }

    fn update_rtt(&mut self, sample: f64) {
        match self.rtt_mean {
            None => {
                self.rtt_mean = Some(sample);
                self.rtt_var = sample / 2.0;
            }
            Some(mean) => {
                self.rtt_var = (1.0 - RTT_BETA) * self.rtt_var + RTT_BETA * (mean - sample).abs();
                self.rtt_mean = Some((1.0 - RTT_ALPHA) * mean + RTT_ALPHA * sample);
            }
        }
        let mean = self.rtt_mean.unwrap_or(0.0);
        self.cto = (mean + (4.0 * self.rtt_var).max(0.1)).max(MIN_CTO);
    }

    /// Halves the window at most once per round trip, using the caller's latest estimate `rtt`.
    ///  Unless the lost bytes are being retransmitted (and so stay in flight), they are taken out
    ///  of the flight size.
    pub fn on_data_loss(&mut self, bytes: u64, retransmitting: bool, rtt: Duration, now: Instant) {
        let debounced = self.last_loss_time
            .map(|t| now.saturating_duration_since(t) < rtt)
            .unwrap_or(false);

        if !debounced {
            self.cwnd = (self.cwnd / 2.0).max(MIN_CWND * MSS);
            self.last_loss_time = Some(now);
            debug!("data loss - reducing cwnd to {}", self.cwnd);
        }

        if !retransmitting {
            self.flight_size = (self.flight_size - bytes as f64).max(0.0);
        }
    }

    /// Treats a lack of acks for longer than the congestion timeout as a timeout: the window
    ///  collapses to one MSS and the timeout backs off. Returns true on timeout.
    pub fn check_acks(&mut self, now: Instant) -> bool {
        if self.flight_size <= 0.0 {
            return false;
        }
        if now.saturating_duration_since(self.last_ack_time).as_secs_f64() * 1000.0 <= self.cto {
            return false;
        }

        self.cwnd = MSS;
        self.cto *= 2.0;
        self.last_ack_time = now;
        debug!("no acks for {:?} - resetting cwnd to one MSS, backing off cto to {}ms", self.cto() / 2, self.cto);
        true
    }
}
