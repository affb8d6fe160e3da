//! Helpers for tests: deterministic keys and content, and in-process wiring of swarms without
//!  a real transport.

use crate::integrity::SwarmKeys;
use crate::scheduler::PeerId;
use crate::swarm::{ChannelKey, PeerChannel, Swarm, SwarmConfig, SwarmInput};
use crate::wire::{ChunkAddressingMethod, ContentIntegrityProtectionMethod, LiveSignatureAlgorithm, MerkleHashTreeFunction, SwarmUri};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, trace};


pub const TEST_SECRET: [u8; 32] = [42; 32];

/// the publisher's keys of the swarm all tests use
pub fn test_keys() -> SwarmKeys {
    SwarmKeys::from_ed25519_secret(&TEST_SECRET)
}

pub fn test_uri(keys: &SwarmKeys, chunk_size: u32) -> SwarmUri {
    SwarmUri {
        swarm_id: keys.swarm_id.clone(),
        integrity_method: ContentIntegrityProtectionMethod::UnifiedMerkleTree,
        hash_function: MerkleHashTreeFunction::Sha256,
        signature_algorithm: LiveSignatureAlgorithm::Ed25519,
        addressing_method: ChunkAddressingMethod::ChunkRange32,
        chunk_size,
    }
}

pub fn test_config(chunk_size: u32, live_discard_window: u32) -> Arc<SwarmConfig> {
    let config = SwarmConfig::new(test_uri(&test_keys(), chunk_size))
        .with_live_discard_window(live_discard_window);
    Arc::new(config)
}

/// `n` chunks of `len` bytes each, distinct per chunk and per seed
pub fn test_chunks(n: usize, len: usize, seed: u8) -> Vec<Bytes> {
    (0..n)
        .map(|i| {
            let data = (0..len)
                .map(|j| (i as u8).wrapping_mul(31) ^ (j as u8) ^ seed.wrapping_mul(97))
                .collect::<Vec<_>>();
            Bytes::from(data)
        })
        .collect()
}


/// A publishing and a consuming swarm connected to each other, with datagrams passed by hand
pub struct SwarmPair {
    pub seeder: Swarm,
    pub leecher: Swarm,
    /// the leecher's id inside the seeder
    pub seeder_side: PeerId,
    /// the seeder's id inside the leecher
    pub leecher_side: PeerId,
}
impl SwarmPair {
    /// The leecher initiates the connection; nothing is exchanged until [SwarmPair::deliver]
    pub fn new(config: Arc<SwarmConfig>, now: Instant) -> anyhow::Result<SwarmPair> {
        let keys = test_keys();
        let mut seeder: Swarm = Swarm::new(config.clone(), &keys, now)?;
        let mut leecher: Swarm = Swarm::new(config, &SwarmKeys::public(keys.swarm_id.clone()), now)?;

        let leecher_side = leecher.add_peer(true, now)?;
        let seeder_side = seeder.add_peer(false, now)?;

        Ok(SwarmPair {
            seeder,
            leecher,
            seeder_side,
            leecher_side,
        })
    }

    /// Passes queued datagrams back and forth, verifying received chunks right away, until
    ///  neither side has anything left to send. Returns the number of datagrams delivered.
    pub fn deliver(&mut self, now: Instant) -> usize {
        let mut total = 0;
        loop {
            let mut delivered = 0;

            for (_, datagrams) in self.leecher.flush() {
                for datagram in datagrams {
                    delivered += 1;
                    for job in self.seeder.handle_datagram(self.seeder_side, datagram, now) {
                        self.seeder.complete_verification(job.run());
                    }
                }
            }
            for (_, datagrams) in self.seeder.flush() {
                for datagram in datagrams {
                    delivered += 1;
                    for job in self.leecher.handle_datagram(self.leecher_side, datagram, now) {
                        self.leecher.complete_verification(job.run());
                    }
                }
            }

            if delivered == 0 {
                break;
            }
            total += delivered;
        }

        self.seeder.publish_complete_bins();
        self.leecher.publish_complete_bins();
        total
    }

    /// one scheduling cycle on each side, leecher first
    pub fn run_cycles(&mut self, now: Instant) {
        self.leecher.run_peer(self.leecher_side, now);
        self.seeder.run_peer(self.seeder_side, now);
    }
}


/// A [PeerChannel] that hands datagrams to another driver's input queue. Like a datagram
///  transport, it drops what does not fit into the queue instead of waiting, so two drivers
///  sending to each other never block on each other's full queues.
pub struct InMemoryChannel {
    /// the key under which the receiving driver knows this connection
    pub remote_key: ChannelKey,
    pub remote: mpsc::Sender<SwarmInput>,
}

#[async_trait]
impl PeerChannel for InMemoryChannel {
    async fn send(&self, datagram: Bytes) -> anyhow::Result<()> {
        match self.remote.try_send(SwarmInput::Message { key: self.remote_key, datagram }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("input queue of {:?} is full - dropping datagram", self.remote_key);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("remote driver is gone")),
        }
    }

    async fn close(&self) {
        if let Err(TrySendError::Full(_)) = self.remote.try_send(SwarmInput::Closed { key: self.remote_key }) {
            debug!("input queue of {:?} is full - dropping close notification", self.remote_key);
        }
    }
}

/// Connects two drivers under the same channel key on both sides, the leecher initiating
pub async fn connect_in_memory(seeder: &mpsc::Sender<SwarmInput>, leecher: &mpsc::Sender<SwarmInput>, key: ChannelKey) -> anyhow::Result<()> {
    let to_leecher = InMemoryChannel { remote_key: key, remote: leecher.clone() };
    let to_seeder = InMemoryChannel { remote_key: key, remote: seeder.clone() };

    seeder.send(SwarmInput::Opened { key, channel: Arc::new(to_leecher), initiator: false }).await
        .map_err(|_| anyhow!("seeder driver is gone"))?;
    leecher.send(SwarmInput::Opened { key, channel: Arc::new(to_seeder), initiator: true }).await
        .map_err(|_| anyhow!("leecher driver is gone"))?;
    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::addressing::Address;
    use crate::swarm::SwarmEvent;

    #[test]
    fn test_chunks_are_distinct() {
        let chunks = test_chunks(4, 16, 0);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 16));
        assert_ne!(chunks[0], chunks[1]);
        assert_ne!(test_chunks(1, 16, 0), test_chunks(1, 16, 1));
        assert_eq!(test_chunks(2, 16, 5), test_chunks(2, 16, 5));
    }

    #[tokio::test]
    async fn test_in_memory_channel_drops_when_full() {
        let (sender, mut receiver) = mpsc::channel(1);
        let channel = InMemoryChannel { remote_key: ChannelKey(4), remote: sender };

        channel.send(Bytes::from_static(b"a")).await.unwrap();
        channel.send(Bytes::from_static(b"b")).await.unwrap();
        channel.close().await;

        match receiver.try_recv().unwrap() {
            SwarmInput::Message { key, datagram } => {
                assert_eq!(key, ChannelKey(4));
                assert_eq!(datagram, Bytes::from_static(b"a"));
            }
            other => panic!("unexpected input {:?}", other),
        }
        assert!(receiver.try_recv().is_err());

        drop(receiver);
        assert!(channel.send(Bytes::from_static(b"c")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leecher_receives_subtree_in_one_cycle() {
        let now = Instant::now();
        let mut pair = SwarmPair::new(test_config(8192, 64), now).unwrap();
        let mut events = pair.leecher.subscribe();

        let chunks = test_chunks(16, 8192, 1);
        let address = pair.seeder.inject(chunks.clone(), now).unwrap();
        assert_eq!(address, Address::from_chunk_range(0, 15));

        pair.deliver(now);
        assert!(pair.leecher.peer(pair.leecher_side).unwrap().is_ready());
        assert!(pair.seeder.peer(pair.seeder_side).unwrap().is_ready());

        // requests, then the whole subtree fits into the initial congestion window
        pair.run_cycles(now);
        pair.deliver(now);
        pair.run_cycles(now);
        pair.deliver(now);

        assert_eq!(pair.leecher.scheduler().loaded_ranges(), vec![address]);
        assert_eq!(pair.leecher.stats().chunks_verified, 16);
        assert_eq!(pair.leecher.stats().integrity_errors, 0);
        assert_eq!(pair.leecher.read(&address), Some(chunks.clone()));

        let mut available = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SwarmEvent::DataAvailable(data) = event {
                available.push(data);
            }
        }
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].address, address);
        assert_eq!(available[0].chunks, chunks);

        let seeder_stats = pair.seeder.scheduler().peer(pair.seeder_side).unwrap().stats.clone();
        assert_eq!(seeder_stats.chunks_sent, 16);
        assert_eq!(seeder_stats.chunks_acked, 16);
    }
}
