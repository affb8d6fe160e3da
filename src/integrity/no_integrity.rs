use crate::addressing::{Address, Bin};
use crate::integrity::verifier::{ChunkVerifier, VerifiedPath};
use crate::integrity::{subtree_address, IntegrityProtection};
use crate::wire::{Message, Timestamp};
use bytes::Bytes;
use rustc_hash::FxHashSet;


/// Integrity method "none": every chunk is accepted as it is
pub struct NoIntegrity {
    next_start: Bin,
}
impl NoIntegrity {
    pub fn new() -> NoIntegrity {
        NoIntegrity { next_start: 0 }
    }
}
impl Default for NoIntegrity {
    fn default() -> Self {
        NoIntegrity::new()
    }
}

struct AcceptAll(Bin);
impl ChunkVerifier for AcceptAll {
    fn chunk_bin(&self) -> Bin {
        self.0
    }

    fn verify(&self, _data: &[u8]) -> anyhow::Result<VerifiedPath> {
        Ok(VerifiedPath {
            chunk_bin: self.0,
            ..VerifiedPath::default()
        })
    }
}

impl IntegrityProtection for NoIntegrity {
    fn append_subtree(&mut self, chunks: &[Bytes], _timestamp: Timestamp) -> anyhow::Result<Address> {
        let address = subtree_address(self.next_start, chunks.len());
        self.next_start = address.end + 2;
        Ok(address)
    }

    fn integrity_messages(&self, _bin: Bin, _known: &mut FxHashSet<Bin>) -> Vec<Message> {
        Vec::new()
    }

    fn on_integrity(&mut self, _address: &Address, _hash: &[u8]) -> bool {
        true
    }

    fn on_signed_integrity(&mut self, _address: &Address, _timestamp: Timestamp, _signature: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_verifier(&self, bin: Bin) -> anyhow::Result<Box<dyn ChunkVerifier>> {
        Ok(Box::new(AcceptAll(bin)))
    }

    fn commit(&mut self, _path: VerifiedPath) {
    }
}
