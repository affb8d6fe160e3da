use crate::util::buf_ext::BufExt;
use bytes::{Buf, BufMut};
use std::time::Duration;
use tokio::time::Instant;


/// A point in time relative to a swarm's monotonic epoch, or a (possibly negative) duration.
///  Not wall clock time: timestamps from different peers are only comparable through their
///  differences.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    pub seconds: i32,
    pub nanoseconds: i32,
}
impl Timestamp {
    pub const BYTE_LEN: usize = 8;

    pub fn since(epoch: Instant, now: Instant) -> Timestamp {
        Timestamp::from_duration(now.saturating_duration_since(epoch))
    }

    pub fn from_duration(d: Duration) -> Timestamp {
        Timestamp {
            seconds: d.as_secs().min(i32::MAX as u64) as i32,
            nanoseconds: d.subsec_nanos() as i32,
        }
    }

    pub fn from_millis_f64(millis: f64) -> Timestamp {
        let nanos_total = (millis * 1_000_000.0).round() as i64;
        Timestamp {
            seconds: nanos_total.div_euclid(1_000_000_000) as i32,
            nanoseconds: nanos_total.rem_euclid(1_000_000_000) as i32,
        }
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.seconds as f64 * 1000.0 + self.nanoseconds as f64 / 1_000_000.0
    }

    /// `self - other` as a signed timestamp
    pub fn minus(&self, other: &Timestamp) -> Timestamp {
        Timestamp::from_millis_f64(self.as_millis_f64() - other.as_millis_f64())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.seconds);
        buf.put_i32(self.nanoseconds);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Timestamp> {
        let seconds = buf.try_read_i32()?;
        let nanoseconds = buf.try_read_i32()?;
        Ok(Timestamp { seconds, nanoseconds })
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(Duration::ZERO, 0, 0)]
    #[case::millis(Duration::from_millis(1500), 1, 500_000_000)]
    #[case::nanos(Duration::from_nanos(3), 0, 3)]
    fn test_from_duration(#[case] d: Duration, #[case] seconds: i32, #[case] nanoseconds: i32) {
        assert_eq!(Timestamp::from_duration(d), Timestamp { seconds, nanoseconds });
    }

    #[rstest]
    #[case::positive(2500.0, 2, 500_000_000)]
    #[case::negative(-250.0, -1, 750_000_000)]
    fn test_millis(#[case] millis: f64, #[case] seconds: i32, #[case] nanoseconds: i32) {
        let ts = Timestamp::from_millis_f64(millis);
        assert_eq!(ts, Timestamp { seconds, nanoseconds });
        assert_eq!(ts.as_millis_f64(), millis);
    }

    #[test]
    fn test_minus() {
        let a = Timestamp { seconds: 3, nanoseconds: 100_000_000 };
        let b = Timestamp { seconds: 1, nanoseconds: 600_000_000 };
        assert_eq!(a.minus(&b).as_millis_f64(), 1500.0);
        assert_eq!(b.minus(&a).as_millis_f64(), -1500.0);
    }

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        Timestamp { seconds: -1, nanoseconds: 2 }.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 2]);
        let mut b: &[u8] = &buf;
        assert_eq!(Timestamp::try_deser(&mut b).unwrap(), Timestamp { seconds: -1, nanoseconds: 2 });
    }
}
