use crate::util::base64::{decode_url_safe, encode_url_safe};
use crate::wire::{ChunkAddressingMethod, ContentIntegrityProtectionMethod, LiveSignatureAlgorithm, MerkleHashTreeFunction, ProtocolOptions, ProtocolVersion, SupportedMessages, SwarmId, WireCodec, MessageType};
use anyhow::{anyhow, bail, Context};
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const SCHEME_PREFIX: &str = "magnet:?";
const URN_PREFIX: &str = "urn:ppspp:";

/// Identifies a live swarm together with the content-defining options every peer must agree
///  on, e.g. `magnet:?xt=urn:ppspp:<swarm id>&x.im=3&x.hf=2&x.sa=15&x.am=2&x.cs=8192`
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SwarmUri {
    pub swarm_id: SwarmId,
    pub integrity_method: ContentIntegrityProtectionMethod,
    pub hash_function: MerkleHashTreeFunction,
    pub signature_algorithm: LiveSignatureAlgorithm,
    pub addressing_method: ChunkAddressingMethod,
    pub chunk_size: u32,
}
impl SwarmUri {
    pub fn codec(&self) -> anyhow::Result<WireCodec> {
        WireCodec::new(self.addressing_method, self.hash_function, &self.swarm_id, self.chunk_size)
    }

    /// the options this side announces in its HANDSHAKE
    pub fn protocol_options(&self, live_discard_window: u32) -> ProtocolOptions {
        ProtocolOptions {
            version: Some(ProtocolVersion::Ppspp1),
            minimum_version: Some(ProtocolVersion::Ppspp1),
            swarm_id: Some(self.swarm_id.clone()),
            integrity_method: Some(self.integrity_method),
            hash_function: Some(self.hash_function),
            signature_algorithm: Some(self.signature_algorithm),
            addressing_method: Some(self.addressing_method),
            live_discard_window: Some(live_discard_window),
            supported_messages: Some(SupportedMessages::new(&MessageType::SUPPORTED)),
            chunk_size: Some(self.chunk_size),
        }
    }
}

impl Display for SwarmUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}xt={}{}&x.im={}&x.hf={}&x.sa={}&x.am={}&x.cs={}",
               SCHEME_PREFIX,
               URN_PREFIX,
               encode_url_safe(&self.swarm_id.to_bytes()),
               u8::from(self.integrity_method),
               u8::from(self.hash_function),
               u8::from(self.signature_algorithm),
               u8::from(self.addressing_method),
               self.chunk_size,
        )
    }
}

impl FromStr for SwarmUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<SwarmUri> {
        let query = s.strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| anyhow!("not a magnet URI: {}", s))?;

        let mut params = FxHashMap::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=')
                .ok_or_else(|| anyhow!("malformed URI parameter {:?}", pair))?;
            if params.insert(key, value).is_some() {
                bail!("duplicate URI parameter {:?}", key);
            }
        }

        let param = |key: &str| params.get(key)
            .copied()
            .ok_or_else(|| anyhow!("URI parameter {} is missing", key));

        let xt = param("xt")?;
        let encoded_swarm_id = xt.strip_prefix(URN_PREFIX)
            .ok_or_else(|| anyhow!("unsupported exact topic {:?}", xt))?;
        let raw_swarm_id = decode_url_safe(encoded_swarm_id)?;
        let swarm_id = SwarmId::try_deser(&mut raw_swarm_id.as_slice())?;

        let signature_algorithm: LiveSignatureAlgorithm = parse_enum(param("x.sa")?, "x.sa")?;
        if signature_algorithm != swarm_id.signature_algorithm {
            bail!("signature algorithm {:?} does not match the swarm id's {:?}", signature_algorithm, swarm_id.signature_algorithm);
        }

        Ok(SwarmUri {
            swarm_id,
            integrity_method: parse_enum(param("x.im")?, "x.im")?,
            hash_function: parse_enum(param("x.hf")?, "x.hf")?,
            signature_algorithm,
            addressing_method: parse_enum(param("x.am")?, "x.am")?,
            chunk_size: param("x.cs")?.parse()
                .with_context(|| "URI parameter x.cs")?,
        })
    }
}

fn parse_enum<T: TryFromPrimitive<Primitive=u8>>(value: &str, key: &str) -> anyhow::Result<T> {
    let raw: u8 = value.parse()
        .with_context(|| format!("URI parameter {}", key))?;
    T::try_from_primitive(raw)
        .map_err(|_| anyhow!("invalid value {} for URI parameter {}", raw, key))
}
