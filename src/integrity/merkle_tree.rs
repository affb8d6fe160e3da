use crate::addressing::{bounds_of, layer, Address, Bin};
use crate::integrity::signature::{Signature, SignedSignature, SwarmKeys};
use crate::wire::{MerkleHashTreeFunction, Timestamp};
use anyhow::bail;
use bytes::Bytes;
use tracing::debug;

/// unverified signatures kept per subtree; the oldest is dropped beyond that
pub const MAX_ROOT_CANDIDATES: usize = 4;


/// A slot in a subtree: the root carries the owner's signature, all other nodes a plain hash
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeNode {
    Plain(Signature),
    Signed(SignedSignature),
}
impl TreeNode {
    pub fn hash(&self) -> &[u8] {
        match self {
            TreeNode::Plain(s) => &s.hash,
            TreeNode::Signed(s) => s.hash(),
        }
    }

    pub fn is_verified(&self) -> bool {
        match self {
            TreeNode::Plain(s) => s.verified,
            TreeNode::Signed(s) => s.is_verified(),
        }
    }
}


/// A Merkle hash tree over a power-of-two sized, aligned run of chunks. The `2n-1` node slots
///  are stored in breadth-first order: the root at index 0, the children of slot `i` at
///  `2i+1` and `2i+2`, leaf `k` at `n-1+k`. Slots are empty until their hash becomes known.
#[derive(Clone, Debug)]
pub struct MerkleHashTree {
    root_address: Address,
    hash_function: MerkleHashTreeFunction,
    nodes: Vec<Option<TreeNode>>,
    /// received root signatures that no chunk was verified against yet, oldest first
    root_candidates: Vec<SignedSignature>,
}
impl MerkleHashTree {
    /// `root_address` must be aligned
    pub fn empty(root_address: Address, hash_function: MerkleHashTreeFunction) -> MerkleHashTree {
        debug_assert!(root_address.is_aligned());
        let num_slots = 2 * root_address.chunk_count() as usize - 1;
        MerkleHashTree {
            root_address,
            hash_function,
            nodes: vec![None; num_slots],
            root_candidates: Vec::new(),
        }
    }

    /// Builds a fully verified tree over locally produced chunks, signing the root if the keys
    ///  allow it. Missing leaves up to the root address's size hash as all-zero padding.
    pub fn from_chunks(chunks: &[Bytes], root_address: Address, hash_function: MerkleHashTreeFunction, keys: &SwarmKeys, timestamp: Timestamp) -> anyhow::Result<MerkleHashTree> {
        if !root_address.is_aligned() {
            bail!("subtree root {:?} is not an aligned bin", root_address);
        }
        let num_leaves = root_address.chunk_count() as usize;
        if chunks.is_empty() || chunks.len() > num_leaves {
            bail!("{} chunks do not fit a subtree of {} leaves", chunks.len(), num_leaves);
        }

        let mut hashes = vec![Vec::new(); 2 * num_leaves - 1];
        for k in 0..num_leaves {
            hashes[num_leaves - 1 + k] = match chunks.get(k) {
                Some(chunk) => hash_function.hash(chunk),
                None => hash_function.empty_hash(),
            };
        }
        for i in (0..num_leaves - 1).rev() {
            hashes[i] = hash_function.hash_pair(&hashes[2 * i + 1], &hashes[2 * i + 2]);
        }

        let mut nodes = Vec::with_capacity(hashes.len());
        let mut hashes = hashes.into_iter();
        if let Some(root_hash) = hashes.next() {
            let root = if keys.can_sign() {
                let root_signature = keys.sign(&root_hash)?;
                TreeNode::Signed(SignedSignature::local(root_hash, timestamp, root_signature))
            }
            else {
                TreeNode::Plain(Signature::verified(root_hash))
            };
            nodes.push(Some(root));
        }
        nodes.extend(hashes.map(|h| Some(TreeNode::Plain(Signature::verified(h)))));

        Ok(MerkleHashTree {
            root_address,
            hash_function,
            nodes,
            root_candidates: Vec::new(),
        })
    }

    pub fn root_address(&self) -> &Address {
        &self.root_address
    }

    pub fn root_bin(&self) -> Bin {
        self.root_address.bin
    }

    pub fn hash_function(&self) -> MerkleHashTreeFunction {
        self.hash_function
    }

    pub fn chunk_count(&self) -> u64 {
        self.root_address.chunk_count()
    }

    pub fn contains_bin(&self, bin: Bin) -> bool {
        self.root_address.contains_bin(bin)
    }

    fn index_of(&self, bin: Bin) -> Option<usize> {
        if !self.contains_bin(bin) {
            return None;
        }
        let (start, _) = bounds_of(bin);
        let node_layer = layer(bin);
        let depth = layer(self.root_address.bin) - node_layer;
        let position = (start - self.root_address.start) / (2u64 << node_layer);
        Some(((1u64 << depth) - 1 + position) as usize)
    }

    fn bin_of(&self, index: usize) -> Bin {
        let depth = (index as u64 + 1).ilog2();
        let position = index as u64 + 1 - (1u64 << depth);
        let node_layer = layer(self.root_address.bin) - depth;
        let start = self.root_address.start + position * (2u64 << node_layer);
        start + (1u64 << node_layer) - 1
    }

    pub fn get(&self, bin: Bin) -> Option<&TreeNode> {
        self.index_of(bin)
            .and_then(|i| self.nodes[i].as_ref())
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes[0].as_ref()
    }

    /// Stores a received hash that is not trusted yet, replacing an earlier untrusted one. A
    ///  verified hash is never overwritten.
    pub fn set_unverified(&mut self, bin: Bin, hash: Vec<u8>) -> bool {
        match self.index_of(bin) {
            Some(i) if i != 0 && !self.nodes[i].as_ref().is_some_and(|n| n.is_verified()) => {
                self.nodes[i] = Some(TreeNode::Plain(Signature::unverified(hash)));
                true
            }
            _ => false,
        }
    }

    /// Stores a hash that was verified against a trusted ancestor, replacing whatever the slot
    ///  held. The root keeps its signature and only has its verified flag set.
    pub fn set_verified(&mut self, bin: Bin, hash: Vec<u8>) {
        let Some(i) = self.index_of(bin) else { return };
        match &mut self.nodes[i] {
            Some(TreeNode::Signed(s)) if s.hash() == hash.as_slice() => s.mark_verified(hash),
            slot => *slot = Some(TreeNode::Plain(Signature::verified(hash))),
        }
    }

    /// Keeps a received root signature as a candidate until a chunk verifies against it. The
    ///  root slot itself is only filled by [MerkleHashTree::confirm_root].
    pub fn add_root_candidate(&mut self, signed: SignedSignature) {
        if self.root().is_some_and(|r| r.is_verified()) {
            return;
        }
        if self.root_candidates.iter().any(|c| c.root_signature == signed.root_signature) {
            return;
        }
        if self.root_candidates.len() >= MAX_ROOT_CANDIDATES {
            let dropped = self.root_candidates.remove(0);
            debug!("dropping unverified root signature with timestamp {:?} for subtree {:?}", dropped.timestamp, self.root_address);
        }
        self.root_candidates.push(signed);
    }

    pub fn root_candidates(&self) -> &[SignedSignature] {
        &self.root_candidates
    }

    /// Makes the candidate with `root_signature` the verified root with hash `hash`, discarding
    ///  all other candidates. Returns false if there is no such candidate.
    pub fn confirm_root(&mut self, hash: Vec<u8>, root_signature: &[u8]) -> bool {
        if self.root().is_some_and(|r| r.is_verified()) {
            return false;
        }
        let Some(i) = self.root_candidates.iter().position(|c| c.root_signature.as_ref() == root_signature) else {
            return false;
        };
        let mut root = self.root_candidates.swap_remove(i);
        root.mark_verified(hash);
        self.nodes[0] = Some(TreeNode::Signed(root));
        self.root_candidates.clear();
        true
    }

    /// fills this tree's empty slots from another tree over the same root
    pub fn merge_from(&mut self, other: MerkleHashTree) {
        debug_assert_eq!(self.root_address, other.root_address);
        for (slot, other_slot) in self.nodes.iter_mut().zip(other.nodes) {
            let replace = match (&slot, &other_slot) {
                (None, Some(_)) => true,
                (Some(mine), Some(theirs)) => !mine.is_verified() && theirs.is_verified(),
                _ => false,
            };
            if replace {
                *slot = other_slot;
            }
        }
        for candidate in other.root_candidates {
            self.add_root_candidate(candidate);
        }
    }

    /// `(bin, node)` for all filled slots in breadth-first order
    pub fn iter(&self) -> impl Iterator<Item=(Bin, &TreeNode)> + '_ {
        self.nodes.iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (self.bin_of(i), n)))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::addressing::{children, parent, sibling};
    use rstest::rstest;

    fn chunks(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![i as u8; 100])).collect()
    }

    fn keys() -> SwarmKeys {
        SwarmKeys::from_ed25519_secret(&[1u8; 32])
    }

    #[test]
    fn test_from_chunks_structure() {
        let f = MerkleHashTreeFunction::Sha256;
        let chunks = chunks(4);
        let tree = MerkleHashTree::from_chunks(&chunks, Address::from_bin(11), f, &keys(), Timestamp::default()).unwrap();

        assert_eq!(tree.get(8).unwrap().hash(), f.hash(&chunks[0]).as_slice());
        assert_eq!(tree.get(14).unwrap().hash(), f.hash(&chunks[3]).as_slice());
        let left = f.hash_pair(&f.hash(&chunks[0]), &f.hash(&chunks[1]));
        let right = f.hash_pair(&f.hash(&chunks[2]), &f.hash(&chunks[3]));
        assert_eq!(tree.get(9).unwrap().hash(), left.as_slice());
        assert_eq!(tree.get(13).unwrap().hash(), right.as_slice());
        assert_eq!(tree.root().unwrap().hash(), f.hash_pair(&left, &right).as_slice());
        assert!(tree.iter().all(|(_, n)| n.is_verified()));

        match tree.root().unwrap() {
            TreeNode::Signed(s) => assert!(keys().verifier().unwrap().verify(s.hash(), &s.root_signature).is_ok()),
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_padding() {
        let f = MerkleHashTreeFunction::Sha1;
        let chunks = chunks(3);
        let tree = MerkleHashTree::from_chunks(&chunks, Address::from_bin(3), f, &keys(), Timestamp::default()).unwrap();
        assert_eq!(tree.get(6).unwrap().hash(), f.empty_hash().as_slice());
        assert_eq!(tree.get(5).unwrap().hash(), f.hash_pair(&f.hash(&chunks[2]), &f.empty_hash()).as_slice());
    }

    #[rstest]
    #[case::too_many(5, Address::from_bin(3))]
    #[case::empty(0, Address::from_bin(3))]
    #[case::unaligned(2, Address::from_range(2, 4))]
    fn test_from_chunks_invalid(#[case] num_chunks: usize, #[case] root_address: Address) {
        assert!(MerkleHashTree::from_chunks(&chunks(num_chunks), root_address, MerkleHashTreeFunction::Sha256, &keys(), Timestamp::default()).is_err());
    }

    #[test]
    fn test_bin_index_mapping() {
        let tree = MerkleHashTree::empty(Address::from_bin(23), MerkleHashTreeFunction::Sha256);
        for i in 0..15 {
            let bin = tree.bin_of(i);
            assert_eq!(tree.index_of(bin), Some(i));
            if i > 0 {
                assert_eq!(tree.bin_of((i - 1) / 2), parent(bin));
            }
            if let Some((left, right)) = children(bin) {
                assert_eq!(tree.index_of(left), Some(2 * i + 1));
                assert_eq!(tree.index_of(right), Some(2 * i + 2));
                assert_eq!(sibling(left), right);
            }
        }
        assert_eq!(tree.bin_of(0), 23);
        assert_eq!(tree.bin_of(7), 16);
        assert_eq!(tree.index_of(14), None);
        assert_eq!(tree.index_of(31), None);
    }

    #[test]
    fn test_set_and_merge() {
        let root = Address::from_bin(1);
        let mut tree = MerkleHashTree::empty(root, MerkleHashTreeFunction::Sha256);
        assert!(tree.set_unverified(2, vec![2; 32]));
        assert!(tree.set_unverified(2, vec![3; 32]));
        assert_eq!(tree.get(2).unwrap().hash(), &[3; 32]);
        assert!(!tree.set_unverified(1, vec![3; 32]), "the root only comes with a signature");
        assert!(!tree.get(2).unwrap().is_verified());

        let mut other = MerkleHashTree::empty(root, MerkleHashTreeFunction::Sha256);
        other.set_verified(0, vec![0; 32]);
        other.set_verified(2, vec![9; 32]);
        tree.merge_from(other);
        assert!(tree.get(0).unwrap().is_verified());
        assert_eq!(tree.get(2).unwrap().hash(), &[9; 32]);
        assert!(tree.root().is_none());
        assert!(!tree.set_unverified(2, vec![4; 32]), "verified hashes are never replaced");
    }

    #[test]
    fn test_root_candidates() {
        let keys = keys();
        let chunks = chunks(2);
        let f = MerkleHashTreeFunction::Sha256;
        let local = MerkleHashTree::from_chunks(&chunks, Address::from_bin(1), f, &keys, Timestamp::default()).unwrap();
        let Some(TreeNode::Signed(genuine)) = local.root() else { panic!("root is not signed") };

        let mut tree = MerkleHashTree::empty(Address::from_bin(1), f);
        for i in 0..MAX_ROOT_CANDIDATES as u8 {
            tree.add_root_candidate(SignedSignature::remote(Timestamp::default(), Bytes::from(vec![i; 64])));
        }
        tree.add_root_candidate(SignedSignature::remote(genuine.timestamp, genuine.root_signature.clone()));
        tree.add_root_candidate(SignedSignature::remote(genuine.timestamp, genuine.root_signature.clone()));
        assert_eq!(tree.root_candidates().len(), MAX_ROOT_CANDIDATES);
        assert!(tree.root().is_none());

        assert!(!tree.confirm_root(genuine.hash().to_vec(), &[9; 64]));
        assert!(tree.confirm_root(genuine.hash().to_vec(), &genuine.root_signature));
        assert_eq!(tree.root(), local.root());
        assert!(tree.root_candidates().is_empty());

        // a verified root is final
        tree.add_root_candidate(SignedSignature::remote(Timestamp::default(), Bytes::from(vec![1; 64])));
        assert!(tree.root_candidates().is_empty());
        assert!(!tree.confirm_root(vec![0; 32], &[1; 64]));
    }
}
