//! Content integrity: chunks are verified against a Merkle hash tree whose subtree roots are
//!  signed by the swarm owner. Verification runs on owned snapshots of the tree so it can be
//!  moved off the swarm's event loop; its result is committed back afterwards.

mod hash;
mod merkle_tree;
mod no_integrity;
mod signature;
mod unified;
mod verifier;

pub use merkle_tree::{MerkleHashTree, TreeNode};
pub use no_integrity::NoIntegrity;
pub use signature::{Signature, SignatureVerifier, SignedSignature, SwarmKeys};
pub use unified::UnifiedMerkleHashTree;
pub use verifier::{ChunkVerifier, MerkleChunkVerifier, VerifiedPath};

use crate::addressing::{Address, Bin};
use crate::wire::{ContentIntegrityProtectionMethod, Message, SwarmUri, Timestamp};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashSet;


/// The integrity scheme of a swarm, as seen by the swarm's protocol logic
pub trait IntegrityProtection: Send {
    /// Allocates the next range of chunks for freshly produced data, builds (and signs) the
    ///  tree over it, and returns the range. The range may be larger than the number of chunks
    ///  because subtrees are padded to a power of two.
    fn append_subtree(&mut self, chunks: &[Bytes], timestamp: Timestamp) -> anyhow::Result<Address>;

    /// INTEGRITY and SIGNED_INTEGRITY messages a peer needs to verify the chunk at `bin` on
    ///  arrival, innermost hash first. `known` holds the tree bins whose hashes were sent to
    ///  the peer already, and is updated with everything returned. Chunks the peer verified
    ///  are not assumed known, so each chunk can be verified without waiting for others.
    fn integrity_messages(&self, bin: Bin, known: &mut FxHashSet<Bin>) -> Vec<Message>;

    /// Stores an INTEGRITY hash. Returns false if no subtree covering the address is known
    ///  yet, in which case the caller should hold on to the hash and retry later.
    fn on_integrity(&mut self, address: &Address, hash: &[u8]) -> bool;

    fn on_signed_integrity(&mut self, address: &Address, timestamp: Timestamp, signature: Bytes) -> anyhow::Result<()>;

    /// a verifier with a snapshot of everything currently known about the chunk's path
    fn create_verifier(&self, bin: Bin) -> anyhow::Result<Box<dyn ChunkVerifier>>;

    fn commit(&mut self, path: VerifiedPath);
}


pub fn for_swarm(uri: &SwarmUri, keys: &SwarmKeys, live_discard_window: u64) -> anyhow::Result<Box<dyn IntegrityProtection>> {
    if keys.swarm_id != uri.swarm_id {
        bail!("keys do not belong to swarm {}", uri);
    }
    match uri.integrity_method {
        ContentIntegrityProtectionMethod::None => Ok(Box::new(NoIntegrity::new())),
        ContentIntegrityProtectionMethod::MerkleHashTree | ContentIntegrityProtectionMethod::UnifiedMerkleTree => {
            Ok(Box::new(UnifiedMerkleHashTree::new(uri.hash_function, keys.clone(), live_discard_window)?))
        }
        ContentIntegrityProtectionMethod::SignAll => bail!("integrity protection method {:?} is not supported", uri.integrity_method),
    }
}

/// the aligned range a batch of chunks occupies when it starts at or after `next_start`
pub(crate) fn subtree_address(next_start: Bin, num_chunks: usize) -> Address {
    let span = 2 * (num_chunks.max(1).next_power_of_two() as u64);
    let start = next_start.div_ceil(span) * span;
    Address::from_range(start, start + span - 2)
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(0, 16, 0, 30)]
    #[case::aligned(32, 16, 32, 62)]
    #[case::realign(34, 16, 64, 94)]
    #[case::padded(34, 3, 40, 46)]
    #[case::single(34, 1, 34, 34)]
    fn test_subtree_address(#[case] next_start: Bin, #[case] num_chunks: usize, #[case] start: Bin, #[case] end: Bin) {
        let address = subtree_address(next_start, num_chunks);
        assert_eq!((address.start, address.end), (start, end));
        assert!(address.is_aligned());
    }
}
