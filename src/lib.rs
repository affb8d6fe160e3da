pub mod addressing;
pub mod availability;
pub mod integrity;
pub mod ledbat;
pub mod scheduler;
pub mod swarm;
pub mod util;
pub mod wfq;
pub mod wire;

pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
