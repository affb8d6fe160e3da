use crate::addressing::{parent, sibling, Bin};
use crate::integrity::merkle_tree::{MerkleHashTree, TreeNode};
use crate::integrity::signature::SignatureVerifier;
use crate::wire::MerkleHashTreeFunction;
use anyhow::{anyhow, bail};
use bytes::Bytes;


/// Hashes that became trusted by verifying a chunk, to be committed into the tree
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VerifiedPath {
    pub chunk_bin: Bin,
    /// subtree root, `None` for integrity schemes without a tree
    pub root_bin: Option<Bin>,
    pub hashes: Vec<(Bin, Vec<u8>)>,
    /// the signature the subtree root was checked against, if the path reached an unverified root
    pub root_signature: Option<Bytes>,
}

/// Verifies a chunk's data. Implementations own everything they need, so verification can
///  run on a different thread than the one mutating the tree.
pub trait ChunkVerifier: Send {
    fn chunk_bin(&self) -> Bin;

    fn verify(&self, data: &[u8]) -> anyhow::Result<VerifiedPath>;
}


#[derive(Clone, Debug)]
struct NodeSnapshot {
    hash: Vec<u8>,
    verified: bool,
}
impl From<&TreeNode> for NodeSnapshot {
    fn from(node: &TreeNode) -> Self {
        NodeSnapshot {
            hash: node.hash().to_vec(),
            verified: node.is_verified(),
        }
    }
}

#[derive(Clone, Debug)]
struct PathLevel {
    bin: Bin,
    node: Option<NodeSnapshot>,
    sibling: Option<NodeSnapshot>,
}


/// A snapshot of the path from a chunk's leaf to its subtree root, including the siblings
///  needed to recompute each parent hash
#[derive(Clone, Debug)]
pub struct MerkleChunkVerifier {
    hash_function: MerkleHashTreeFunction,
    chunk_bin: Bin,
    root_bin: Bin,
    /// leaf first, root last
    path: Vec<PathLevel>,
    /// received signatures for an unverified root, any of which may be genuine
    root_signatures: Vec<Bytes>,
    signature_verifier: SignatureVerifier,
}
impl MerkleChunkVerifier {
    pub fn new(tree: &MerkleHashTree, chunk_bin: Bin, signature_verifier: SignatureVerifier) -> anyhow::Result<MerkleChunkVerifier> {
        if chunk_bin % 2 != 0 || !tree.contains_bin(chunk_bin) {
            bail!("chunk bin {} is not a leaf of subtree {:?}", chunk_bin, tree.root_address());
        }

        let root_bin = tree.root_bin();
        let mut path = Vec::new();
        let mut bin = chunk_bin;
        loop {
            let is_root = bin == root_bin;
            path.push(PathLevel {
                bin,
                node: tree.get(bin).map(NodeSnapshot::from),
                sibling: if is_root { None } else { tree.get(sibling(bin)).map(NodeSnapshot::from) },
            });
            if is_root {
                break;
            }
            bin = parent(bin);
        }

        let root_signatures = tree.root_candidates().iter()
            .map(|c| c.root_signature.clone())
            .collect();

        Ok(MerkleChunkVerifier {
            hash_function: tree.hash_function(),
            chunk_bin,
            root_bin,
            path,
            root_signatures,
            signature_verifier,
        })
    }
}

impl ChunkVerifier for MerkleChunkVerifier {
    fn chunk_bin(&self) -> Bin {
        self.chunk_bin
    }

    /// Walks from the leaf towards the root, recomputing each parent from the sibling hashes.
    ///  Stops at the first verified hash on the path, which must equal the recomputed one; at
    ///  an unverified root the received signatures are checked against the recomputed root hash
    ///  until one matches.
    fn verify(&self, data: &[u8]) -> anyhow::Result<VerifiedPath> {
        let mut hash = self.hash_function.hash(data);
        let mut result = VerifiedPath {
            chunk_bin: self.chunk_bin,
            root_bin: Some(self.root_bin),
            hashes: Vec::new(),
            root_signature: None,
        };

        for level in &self.path {
            if let Some(node) = level.node.as_ref().filter(|n| n.verified) {
                if node.hash != hash {
                    bail!("hash mismatch at bin {} verifying chunk bin {}", level.bin, self.chunk_bin);
                }
                return Ok(result);
            }

            result.hashes.push((level.bin, hash.clone()));

            if level.bin == self.root_bin {
                if self.root_signatures.is_empty() {
                    bail!("no signed root hash for subtree {} yet", self.root_bin);
                }
                let root_signature = self.root_signatures.iter()
                    .find(|signature| self.signature_verifier.verify(&hash, signature).is_ok())
                    .ok_or_else(|| anyhow!("no signature for subtree {} matches its root hash", self.root_bin))?;
                result.root_signature = Some(root_signature.clone());
                return Ok(result);
            }

            let sibling_bin = sibling(level.bin);
            let sibling = level.sibling.as_ref()
                .ok_or_else(|| anyhow!("missing hash for bin {} verifying chunk bin {}", sibling_bin, self.chunk_bin))?;
            result.hashes.push((sibling_bin, sibling.hash.clone()));

            hash = if level.bin < sibling_bin {
                self.hash_function.hash_pair(&hash, &sibling.hash)
            }
            else {
                self.hash_function.hash_pair(&sibling.hash, &hash)
            };
        }
        bail!("path for chunk bin {} does not reach subtree root {}", self.chunk_bin, self.root_bin)
    }
}
