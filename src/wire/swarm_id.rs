use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::LiveSignatureAlgorithm;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};


#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RsaParameters {
    pub modulus_bits: u16,
    pub public_exponent: Bytes,
}

/// Identifies a live swarm by the public key its content is signed with
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SwarmId {
    pub signature_algorithm: LiveSignatureAlgorithm,
    /// only present for RSA algorithms
    pub rsa: Option<RsaParameters>,
    pub public_key: Bytes,
}
impl SwarmId {
    pub fn ed25519(public_key: Bytes) -> SwarmId {
        SwarmId {
            signature_algorithm: LiveSignatureAlgorithm::Ed25519,
            rsa: None,
            public_key,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self.signature_algorithm {
            LiveSignatureAlgorithm::Ed25519 => 64,
            LiveSignatureAlgorithm::EcdsaP256Sha256 => 64,
            LiveSignatureAlgorithm::EcdsaP384Sha384 => 96,
            LiveSignatureAlgorithm::RsaSha1 | LiveSignatureAlgorithm::RsaSha256 => self.rsa
                .as_ref()
                .map(|rsa| {
                    let modulus_bits: usize = rsa.modulus_bits.safe_cast();
                    modulus_bits.div_ceil(8)
                })
                .unwrap_or(0),
        }
    }

    pub fn byte_len(&self) -> usize {
        let rsa_len = self.rsa.as_ref()
            .map(|rsa| 3 + rsa.public_exponent.len())
            .unwrap_or(0);
        1 + rsa_len + self.public_key.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.signature_algorithm.into());
        if let Some(rsa) = &self.rsa {
            buf.put_u16(rsa.modulus_bits);
            buf.put_u8(rsa.public_exponent.len().prechecked_cast());
            buf.put_slice(&rsa.public_exponent);
        }
        buf.put_slice(&self.public_key);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// consumes the entire buffer: the public key is everything after the header
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SwarmId> {
        let raw_alg = buf.try_read_u8()?;
        let signature_algorithm = LiveSignatureAlgorithm::try_from(raw_alg)
            .map_err(|_| anyhow!("unknown signature algorithm {}", raw_alg))?;

        let rsa = if signature_algorithm.is_rsa() {
            let modulus_bits = buf.try_read_u16()?;
            let exponent_len = buf.try_read_u8()?.safe_cast();
            let public_exponent = buf.try_read_bytes(exponent_len)?;
            Some(RsaParameters { modulus_bits, public_exponent })
        }
        else {
            None
        };

        let public_key = buf.copy_to_bytes(buf.remaining());
        if public_key.is_empty() {
            bail!("swarm id without public key");
        }
        if signature_algorithm == LiveSignatureAlgorithm::Ed25519 && public_key.len() != 32 {
            bail!("ED25519 public key must be 32 bytes, was {}", public_key.len());
        }

        Ok(SwarmId {
            signature_algorithm,
            rsa,
            public_key,
        })
    }
}
