use crate::addressing::{parent, sibling, Address, Bin};
use crate::integrity::merkle_tree::{MerkleHashTree, TreeNode};
use crate::integrity::signature::{SignatureVerifier, SignedSignature, SwarmKeys};
use crate::integrity::verifier::{ChunkVerifier, MerkleChunkVerifier, VerifiedPath};
use crate::integrity::{subtree_address, IntegrityProtection};
use crate::wire::{IntegrityMessage, MerkleHashTreeFunction, Message, SignedIntegrityMessage, Timestamp};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tracing::{debug, trace};


/// The Merkle tree of a live stream: a sequence of subtrees over disjoint, ascending chunk
///  ranges, each with its own signed root. Subtrees fall off the low end once they cover more
///  chunks than the live discard window.
pub struct UnifiedMerkleHashTree {
    hash_function: MerkleHashTreeFunction,
    keys: SwarmKeys,
    signature_verifier: SignatureVerifier,
    live_discard_window: u64,
    /// sorted by root address
    subtrees: VecDeque<MerkleHashTree>,
    next_start: Bin,
}
impl UnifiedMerkleHashTree {
    pub fn new(hash_function: MerkleHashTreeFunction, keys: SwarmKeys, live_discard_window: u64) -> anyhow::Result<UnifiedMerkleHashTree> {
        Ok(UnifiedMerkleHashTree {
            hash_function,
            signature_verifier: keys.verifier()?,
            keys,
            live_discard_window,
            subtrees: VecDeque::new(),
            next_start: 0,
        })
    }

    pub fn subtrees(&self) -> impl Iterator<Item=&MerkleHashTree> {
        self.subtrees.iter()
    }

    fn find_index(&self, bin: Bin) -> Option<usize> {
        let i = self.subtrees.partition_point(|t| t.root_address().end < bin);
        match self.subtrees.get(i) {
            Some(t) if t.contains_bin(bin) => Some(i),
            _ => None,
        }
    }

    /// the subtree containing `bin`
    pub fn find_subtree(&self, bin: Bin) -> Option<&MerkleHashTree> {
        self.find_index(bin).map(|i| &self.subtrees[i])
    }

    fn find_subtree_mut(&mut self, bin: Bin) -> Option<&mut MerkleHashTree> {
        self.find_index(bin).map(|i| &mut self.subtrees[i])
    }

    /// Merges a subtree into the stored one with the same root, filling in missing slots, or
    ///  inserts it if there is none. Subtrees overlapping a stored subtree with a different
    ///  root are rejected.
    pub fn insert_subtree(&mut self, tree: MerkleHashTree) -> anyhow::Result<()> {
        let address = *tree.root_address();
        let i = self.subtrees.partition_point(|t| t.root_address().end < address.start);
        match self.subtrees.get_mut(i) {
            Some(existing) if existing.root_address() == &address => {
                existing.merge_from(tree);
            }
            Some(existing) if existing.root_address().start <= address.end => {
                bail!("subtree {:?} overlaps stored subtree {:?}", address, existing.root_address());
            }
            _ => {
                debug!("adding subtree {:?}", address);
                self.subtrees.insert(i, tree);
                self.next_start = self.next_start.max(address.end + 2);
                self.prune_subtrees();
            }
        }
        Ok(())
    }

    /// drops the oldest subtrees while the rest still cover more than the live discard window
    pub fn prune_subtrees(&mut self) {
        let mut total: u64 = self.subtrees.iter().map(|t| t.chunk_count()).sum();
        while self.subtrees.len() > 1 && total > self.live_discard_window {
            if let Some(dropped) = self.subtrees.pop_front() {
                trace!("pruning subtree {:?}", dropped.root_address());
                total -= dropped.chunk_count();
            }
        }
    }
}

impl IntegrityProtection for UnifiedMerkleHashTree {
    fn append_subtree(&mut self, chunks: &[Bytes], timestamp: Timestamp) -> anyhow::Result<Address> {
        let address = subtree_address(self.next_start, chunks.len());
        let tree = MerkleHashTree::from_chunks(chunks, address, self.hash_function, &self.keys, timestamp)?;
        self.insert_subtree(tree)?;
        Ok(address)
    }

    fn integrity_messages(&self, bin: Bin, known: &mut FxHashSet<Bin>) -> Vec<Message> {
        let Some(tree) = self.find_subtree(bin) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        let mut node = bin;
        while node != tree.root_bin() {
            let sibling_bin = sibling(node);
            if !known.contains(&sibling_bin) {
                if let Some(sibling_node) = tree.get(sibling_bin) {
                    result.push(Message::Integrity(IntegrityMessage {
                        address: Address::from_bin(sibling_bin),
                        hash: Bytes::copy_from_slice(sibling_node.hash()),
                    }));
                    known.insert(sibling_bin);
                }
            }
            node = parent(node);
        }

        if known.insert(node) {
            if let Some(TreeNode::Signed(root)) = tree.root() {
                result.push(Message::SignedIntegrity(SignedIntegrityMessage {
                    address: *tree.root_address(),
                    timestamp: root.timestamp,
                    signature: root.root_signature.clone(),
                }));
            }
        }
        result
    }

    fn on_integrity(&mut self, address: &Address, hash: &[u8]) -> bool {
        match self.find_subtree_mut(address.bin) {
            Some(tree) => {
                tree.set_unverified(address.bin, hash.to_vec());
                true
            }
            None => false,
        }
    }

    /// The signed root arrives without its hash: the hash is recomputed from the chunk that
    ///  is verified against it, so the signature is kept as a candidate until then. Several
    ///  candidates may be pending, so a forged one cannot block the genuine one.
    fn on_signed_integrity(&mut self, address: &Address, timestamp: Timestamp, signature: Bytes) -> anyhow::Result<()> {
        if !address.is_aligned() {
            bail!("signed subtree root {:?} is not an aligned bin", address);
        }
        let candidate = SignedSignature::remote(timestamp, signature);
        if let Some(tree) = self.find_subtree_mut(address.bin) {
            if tree.root_address() == address {
                tree.add_root_candidate(candidate);
                return Ok(());
            }
        }

        let mut tree = MerkleHashTree::empty(*address, self.hash_function);
        tree.add_root_candidate(candidate);
        self.insert_subtree(tree)
    }

    fn create_verifier(&self, bin: Bin) -> anyhow::Result<Box<dyn ChunkVerifier>> {
        let tree = self.find_subtree(bin)
            .ok_or_else(|| anyhow!("no subtree known for chunk bin {}", bin))?;
        Ok(Box::new(MerkleChunkVerifier::new(tree, bin, self.signature_verifier.clone())?))
    }

    fn commit(&mut self, path: VerifiedPath) {
        let Some(root_bin) = path.root_bin else { return };
        let Some(tree) = self.find_subtree_mut(root_bin) else {
            debug!("subtree {} was pruned before chunk bin {} was committed", root_bin, path.chunk_bin);
            return;
        };
        if tree.root_bin() != root_bin {
            return;
        }

        for (bin, hash) in path.hashes {
            if bin == root_bin {
                if let Some(root_signature) = &path.root_signature {
                    tree.confirm_root(hash, root_signature);
                }
            }
            else {
                tree.set_verified(bin, hash);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn keys() -> SwarmKeys {
        SwarmKeys::from_ed25519_secret(&[7u8; 32])
    }

    fn chunks(n: usize, seed: u8) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![seed.wrapping_add(i as u8); 1024])).collect()
    }

    fn publisher(live_discard_window: u64) -> UnifiedMerkleHashTree {
        UnifiedMerkleHashTree::new(MerkleHashTreeFunction::Sha256, keys(), live_discard_window).unwrap()
    }

    fn receiver() -> UnifiedMerkleHashTree {
        UnifiedMerkleHashTree::new(MerkleHashTreeFunction::Sha256, SwarmKeys::public(keys().swarm_id), 64).unwrap()
    }

    /// feeds integrity messages to a receiver the way a peer does, holding back hashes for
    ///  subtrees that are not known yet
    fn deliver(receiver: &mut UnifiedMerkleHashTree, messages: Vec<Message>) {
        let mut pending = Vec::new();
        for message in messages {
            match message {
                Message::Integrity(m) => {
                    if !receiver.on_integrity(&m.address, &m.hash) {
                        pending.push(m);
                    }
                }
                Message::SignedIntegrity(m) => {
                    receiver.on_signed_integrity(&m.address, m.timestamp, m.signature).unwrap();
                    pending.retain(|m| !receiver.on_integrity(&m.address, &m.hash));
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn test_local_round_trip() {
        let mut tree = publisher(64);
        let chunks = chunks(16, 0);
        let address = tree.append_subtree(&chunks, Timestamp::default()).unwrap();
        assert_eq!((address.start, address.end), (0, 30));

        for (i, chunk) in chunks.iter().enumerate() {
            let bin = 2 * i as Bin;
            let verifier = tree.create_verifier(bin).unwrap();
            assert!(verifier.verify(chunk).is_ok());

            let mut mutated = chunk.to_vec();
            mutated[i * 17 % 1024] ^= 1;
            assert!(verifier.verify(&mutated).is_err());
        }
    }

    #[test]
    fn test_remote_round_trip() {
        let mut sender = publisher(64);
        let chunks = chunks(16, 100);
        sender.append_subtree(&chunks, Timestamp { seconds: 1, nanoseconds: 0 }).unwrap();

        let mut receiver = receiver();
        let mut known = FxHashSet::default();
        for (i, chunk) in chunks.iter().enumerate() {
            let bin = 2 * i as Bin;
            let messages = sender.integrity_messages(bin, &mut known);
            if i == 0 {
                // four sibling hashes from leaf to root, then the signed root
                assert_eq!(messages.len(), 5);
                assert!(matches!(messages.last(), Some(Message::SignedIntegrity(_))));
            }
            else if i == 1 {
                // bin 0 is the only hash on the path that was not sent yet
                assert_eq!(messages.len(), 1);
            }
            deliver(&mut receiver, messages);

            let verifier = receiver.create_verifier(bin).unwrap();
            let mut mutated = chunk.to_vec();
            mutated[0] ^= 0xff;
            assert!(verifier.verify(&mutated).is_err());

            let path = verifier.verify(chunk).unwrap();
            assert_eq!(path.root_signature.is_some(), i == 0);
            receiver.commit(path);
            assert!(receiver.find_subtree(bin).unwrap().get(bin).unwrap().is_verified());
        }

        let subtree = receiver.find_subtree(0).unwrap();
        assert!(subtree.iter().all(|(_, n)| n.is_verified()));
        assert_eq!(subtree.root().unwrap().hash(), sender.find_subtree(0).unwrap().root().unwrap().hash());
    }

    #[test]
    fn test_verification_does_not_depend_on_commits() {
        let mut sender = publisher(64);
        let chunks = chunks(8, 3);
        sender.append_subtree(&chunks, Timestamp::default()).unwrap();

        let mut receiver = receiver();
        let mut known = FxHashSet::default();
        let mut verifiers = Vec::new();
        for i in 0..chunks.len() {
            let bin = 2 * i as Bin;
            deliver(&mut receiver, sender.integrity_messages(bin, &mut known));
            verifiers.push(receiver.create_verifier(bin).unwrap());
        }

        // verified in reverse order, each before anything was committed
        let paths = verifiers.iter().zip(chunks.iter()).rev()
            .map(|(verifier, chunk)| verifier.verify(chunk).unwrap())
            .collect::<Vec<_>>();
        for path in paths {
            assert!(path.root_signature.is_some());
            receiver.commit(path);
        }
        assert!(receiver.find_subtree(0).unwrap().iter().all(|(_, n)| n.is_verified()));
    }

    #[test]
    fn test_forged_root_rejected() {
        let mut sender = publisher(64);
        let chunks = chunks(4, 0);
        sender.append_subtree(&chunks, Timestamp::default()).unwrap();

        let mut messages = sender.integrity_messages(0, &mut FxHashSet::default());
        if let Some(Message::SignedIntegrity(m)) = messages.last_mut() {
            let mut forged = m.signature.to_vec();
            forged[10] ^= 1;
            m.signature = Bytes::from(forged);
        }
        let mut receiver = receiver();
        deliver(&mut receiver, messages);

        let verifier = receiver.create_verifier(0).unwrap();
        assert!(verifier.verify(&chunks[0]).is_err());
    }

    #[test]
    fn test_forged_root_does_not_block_genuine_one() {
        let mut sender = publisher(64);
        let chunks = chunks(4, 0);
        sender.append_subtree(&chunks, Timestamp::default()).unwrap();
        let messages = sender.integrity_messages(0, &mut FxHashSet::default());

        let mut receiver = receiver();
        let Some(Message::SignedIntegrity(genuine)) = messages.last().cloned() else { panic!("no signed root") };
        receiver.on_signed_integrity(&genuine.address, genuine.timestamp, Bytes::from(vec![0u8; 64])).unwrap();
        deliver(&mut receiver, messages);

        let path = receiver.create_verifier(0).unwrap().verify(&chunks[0]).unwrap();
        assert_eq!(path.root_signature, Some(genuine.signature.clone()));
        receiver.commit(path);
        assert!(receiver.find_subtree(0).unwrap().root().unwrap().is_verified());

        // later signatures no longer matter, and the root is not checked again
        receiver.on_signed_integrity(&genuine.address, genuine.timestamp, Bytes::from(vec![1u8; 64])).unwrap();
        assert!(receiver.find_subtree(0).unwrap().root_candidates().is_empty());
        let path = receiver.create_verifier(2).unwrap().verify(&chunks[1]).unwrap();
        assert_eq!(path.root_signature, None);
    }

    #[test]
    fn test_missing_hashes() {
        let mut receiver = receiver();
        assert!(receiver.create_verifier(0).is_err());

        // signed root without the sibling hashes
        let mut sender = publisher(64);
        let chunks = chunks(4, 0);
        sender.append_subtree(&chunks, Timestamp::default()).unwrap();
        let messages = sender.integrity_messages(0, &mut FxHashSet::default());
        let signed = messages.into_iter()
            .filter(|m| matches!(m, Message::SignedIntegrity(_)))
            .collect();
        deliver(&mut receiver, signed);
        assert!(receiver.create_verifier(0).unwrap().verify(&chunks[0]).is_err());
    }

    #[rstest]
    #[case::within_window(64, 3)]
    #[case::pruned(32, 2)]
    #[case::tiny_window(8, 1)]
    fn test_prune(#[case] live_discard_window: u64, #[case] expected_subtrees: usize) {
        let mut tree = publisher(live_discard_window);
        let addresses = (0..3)
            .map(|i| tree.append_subtree(&chunks(16, i), Timestamp::default()).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(addresses.iter().map(|a| a.start).collect::<Vec<_>>(), vec![0, 32, 64]);
        assert_eq!(tree.subtrees().count(), expected_subtrees);
        assert!(tree.find_subtree(addresses[2].start).is_some());
        assert_eq!(tree.find_subtree(0).is_some(), expected_subtrees == 3);
    }

    #[test]
    fn test_insert_overlapping() {
        let mut tree = publisher(64);
        tree.append_subtree(&chunks(4, 0), Timestamp::default()).unwrap();
        assert!(tree.insert_subtree(MerkleHashTree::empty(Address::from_bin(1), MerkleHashTreeFunction::Sha256)).is_err());
        assert!(tree.insert_subtree(MerkleHashTree::empty(Address::from_bin(3), MerkleHashTreeFunction::Sha256)).is_ok());
        assert_eq!(tree.subtrees().count(), 1);
    }
}
