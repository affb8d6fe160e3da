use crate::util::random::Random;
use crate::wire::{LiveSignatureAlgorithm, SwarmId, Timestamp};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt::{Debug, Formatter};


/// A hash in a Merkle tree slot. Its value must not be trusted for comparisons before
///  `verified` is set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    pub hash: Vec<u8>,
    pub verified: bool,
}
impl Signature {
    pub fn verified(hash: Vec<u8>) -> Signature {
        Signature { hash, verified: true }
    }

    pub fn unverified(hash: Vec<u8>) -> Signature {
        Signature { hash, verified: false }
    }
}

/// The root hash of a subtree together with the swarm owner's signature over it. A received
///  root is only trusted once a chunk below it was hashed up to a root hash the signature
///  matches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedSignature {
    pub signature: Signature,
    pub timestamp: Timestamp,
    pub root_signature: Bytes,
}
impl SignedSignature {
    pub fn local(hash: Vec<u8>, timestamp: Timestamp, root_signature: Bytes) -> SignedSignature {
        SignedSignature {
            signature: Signature::verified(hash),
            timestamp,
            root_signature,
        }
    }

    /// a signature received before its root hash is known
    pub fn remote(timestamp: Timestamp, root_signature: Bytes) -> SignedSignature {
        SignedSignature {
            signature: Signature::unverified(Vec::new()),
            timestamp,
            root_signature,
        }
    }

    pub fn hash(&self) -> &[u8] {
        &self.signature.hash
    }

    pub fn is_verified(&self) -> bool {
        self.signature.verified
    }

    /// records a root hash the signature was checked against, on a snapshot of the tree
    pub fn mark_verified(&mut self, hash: Vec<u8>) {
        self.signature = Signature::verified(hash);
    }
}


/// Checks live signatures against a swarm's public key
#[derive(Clone)]
pub struct SignatureVerifier {
    algorithm: LiveSignatureAlgorithm,
    key: Option<VerifyingKey>,
}
impl Debug for SignatureVerifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureVerifier({:?})", self.algorithm)
    }
}
impl SignatureVerifier {
    pub fn new(swarm_id: &SwarmId) -> anyhow::Result<SignatureVerifier> {
        let key = match swarm_id.signature_algorithm {
            LiveSignatureAlgorithm::Ed25519 => {
                let raw: [u8; 32] = swarm_id.public_key.as_ref().try_into()?;
                Some(VerifyingKey::from_bytes(&raw)?)
            }
            _ => None,
        };
        Ok(SignatureVerifier {
            algorithm: swarm_id.signature_algorithm,
            key,
        })
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> anyhow::Result<()> {
        let key = self.key.as_ref()
            .ok_or_else(|| anyhow!("unsupported signature algorithm {:?}", self.algorithm))?;
        let signature = ed25519_dalek::Signature::from_slice(signature)?;
        key.verify(message, &signature)?;
        Ok(())
    }
}


/// The key material of a swarm: its id, and the private key if this side publishes into it
#[derive(Clone)]
pub struct SwarmKeys {
    pub swarm_id: SwarmId,
    signing_key: Option<SigningKey>,
}
impl Debug for SwarmKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmKeys")
            .field("swarm_id", &self.swarm_id)
            .field("can_sign", &self.signing_key.is_some())
            .finish()
    }
}
impl SwarmKeys {
    pub fn generate<R: Random>(algorithm: LiveSignatureAlgorithm) -> anyhow::Result<SwarmKeys> {
        if algorithm != LiveSignatureAlgorithm::Ed25519 {
            bail!("key generation is not supported for {:?}", algorithm);
        }
        let mut secret = [0u8; 32];
        R::fill_bytes(&mut secret);
        Ok(SwarmKeys::from_ed25519_secret(&secret))
    }

    pub fn from_ed25519_secret(secret: &[u8; 32]) -> SwarmKeys {
        let signing_key = SigningKey::from_bytes(secret);
        SwarmKeys {
            swarm_id: SwarmId::ed25519(Bytes::copy_from_slice(signing_key.verifying_key().as_bytes())),
            signing_key: Some(signing_key),
        }
    }

    /// keys of a swarm this side only consumes
    pub fn public(swarm_id: SwarmId) -> SwarmKeys {
        SwarmKeys {
            swarm_id,
            signing_key: None,
        }
    }

    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn sign(&self, message: &[u8]) -> anyhow::Result<Bytes> {
        let key = self.signing_key.as_ref()
            .ok_or_else(|| anyhow!("no private key for swarm"))?;
        Ok(Bytes::copy_from_slice(&key.sign(message).to_bytes()))
    }

    pub fn verifier(&self) -> anyhow::Result<SignatureVerifier> {
        SignatureVerifier::new(&self.swarm_id)
    }
}
