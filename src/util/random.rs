use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Randomness as a type parameter, so that the request scheduler's probabilistic decisions
///  can be pinned down in tests
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_f64_range(range: Range<f64>) -> f64;
    fn fill_bytes(buf: &mut [u8]);
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::thread_rng().gen_range(range)
    }

    fn fill_bytes(buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf)
    }
}
