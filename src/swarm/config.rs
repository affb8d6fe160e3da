use crate::scheduler::SchedulerConfig;
use crate::wire::{SwarmUri, MAX_DATAGRAM_SIZE};
use anyhow::bail;


#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub uri: SwarmUri,

    /// number of chunks behind the newest one that are kept, announced in the HANDSHAKE
    pub live_discard_window: u32,

    pub scheduler: SchedulerConfig,

    /// upper bound for serialized datagrams, i.e. the transport's message size limit
    pub max_datagram_size: usize,

    /// INTEGRITY hashes per peer held back while the subtree they belong to is unknown
    pub max_pending_integrity: usize,

    /// capacity of the event channel; slow subscribers lose the oldest events
    pub event_buffer_size: usize,

    /// capacity of a driver's input channel
    pub input_buffer_size: usize,
}

impl SwarmConfig {
    pub const DEFAULT_LIVE_DISCARD_WINDOW: u32 = 1024;

    pub fn new(uri: SwarmUri) -> SwarmConfig {
        let scheduler = SchedulerConfig::new(uri.chunk_size, Self::DEFAULT_LIVE_DISCARD_WINDOW);
        SwarmConfig {
            uri,
            live_discard_window: Self::DEFAULT_LIVE_DISCARD_WINDOW,
            scheduler,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            max_pending_integrity: 1024,
            event_buffer_size: 128,
            input_buffer_size: 1024,
        }
    }

    /// sets the live discard window both for the swarm and its scheduler
    pub fn with_live_discard_window(mut self, live_discard_window: u32) -> SwarmConfig {
        self.live_discard_window = live_discard_window;
        self.scheduler.live_discard_window = live_discard_window;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler.validate()?;
        if self.scheduler.chunk_size != self.uri.chunk_size {
            bail!("scheduler chunk size {} differs from the swarm's chunk size {}", self.scheduler.chunk_size, self.uri.chunk_size);
        }
        if self.scheduler.live_discard_window != self.live_discard_window {
            bail!("scheduler live discard window {} differs from the swarm's {}", self.scheduler.live_discard_window, self.live_discard_window);
        }
        if self.max_datagram_size > MAX_DATAGRAM_SIZE || self.max_datagram_size < 64 {
            bail!("max datagram size must be between 64 and {}, was {}", MAX_DATAGRAM_SIZE, self.max_datagram_size);
        }
        if self.event_buffer_size == 0 || self.input_buffer_size == 0 {
            bail!("channel buffer sizes must be positive");
        }
        Ok(())
    }
}
