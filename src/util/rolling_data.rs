use crate::util::ring_buffer::RingBuffer;
use std::time::Duration;
use tokio::time::Instant;


/// Minimum of all values added within a sliding time window. The window is split into a fixed
///  number of buckets of equal duration, and values expire one bucket at a time.
pub struct RollingMinimum {
    buckets: RingBuffer<Option<f64>>,
    granularity: Duration,
    origin: Instant,
}
impl RollingMinimum {
    pub fn new(num_buckets: usize, granularity: Duration, origin: Instant) -> RollingMinimum {
        assert!(!granularity.is_zero());
        RollingMinimum {
            buckets: RingBuffer::new(num_buckets),
            granularity,
            origin,
        }
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos() / self.granularity.as_nanos()) as u64
    }

    pub fn add_value(&mut self, now: Instant, value: f64) {
        let index = self.bucket_index(now);
        if let Some(bucket) = self.buckets.get_or_advance(index) {
            *bucket = Some(match *bucket {
                Some(prev) => prev.min(value),
                None => value,
            });
        }
    }

    /// minimum over all buckets that are still current at `now`, `None` if there are none
    pub fn min(&self, now: Instant) -> Option<f64> {
        let current = self.bucket_index(now);
        let capacity = self.buckets.capacity();
        self.buckets.iter()
            .filter(|(index, _)| index + capacity > current)
            .filter_map(|(_, v)| *v)
            .reduce(f64::min)
    }
}


/// Exponentially weighted moving average
#[derive(Clone, Debug)]
pub struct MovingAverage {
    alpha: f64,
    value: Option<f64>,
}
impl MovingAverage {
    pub fn new(alpha: f64) -> MovingAverage {
        assert!(alpha > 0.0 && alpha <= 1.0);
        MovingAverage {
            alpha,
            value: None,
        }
    }

    pub fn add_value(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(prev) => prev + self.alpha * (sample - prev),
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}


/// Bytes per second over a sliding time window
pub struct RateMeter {
    buckets: RingBuffer<u64>,
    granularity: Duration,
    origin: Instant,
}
impl RateMeter {
    pub fn new(num_buckets: usize, granularity: Duration, origin: Instant) -> RateMeter {
        assert!(!granularity.is_zero());
        RateMeter {
            buckets: RingBuffer::new(num_buckets),
            granularity,
            origin,
        }
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos() / self.granularity.as_nanos()) as u64
    }

    pub fn add(&mut self, now: Instant, num_bytes: u64) {
        let index = self.bucket_index(now);
        if let Some(bucket) = self.buckets.get_or_advance(index) {
            *bucket += num_bytes;
        }
    }

    pub fn bytes_per_second(&self, now: Instant) -> f64 {
        let current = self.bucket_index(now);
        let capacity = self.buckets.capacity();
        let total: u64 = self.buckets.iter()
            .filter(|(index, _)| index + capacity > current)
            .map(|(_, v)| *v)
            .sum();
        total as f64 / (self.granularity.as_secs_f64() * capacity as f64)
    }
}
