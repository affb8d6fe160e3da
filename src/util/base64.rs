//! URL-safe base64 (RFC 4648 section 5) without padding, as used for swarm ids in swarm URIs.
//!  Decoding tolerates trailing '=' padding.

use anyhow::{anyhow, bail};

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

pub fn encode_url_safe(data: &[u8]) -> String {
    let mut result = String::with_capacity((data.len() * 4 + 2) / 3);

    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        let num_chars = chunk.len() + 1;
        for i in 0..num_chars {
            let index = (triple >> (18 - 6 * i)) & 0x3f;
            result.push(ALPHABET[index as usize] as char);
        }
    }
    result
}

pub fn decode_url_safe(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.trim_end_matches('=');
    if s.len() % 4 == 1 {
        bail!("invalid base64 length {}", s.len());
    }

    let mut result = Vec::with_capacity(s.len() * 3 / 4);
    let mut accumulator = 0u32;
    let mut num_bits = 0;
    for c in s.bytes() {
        let value = sextet(c).ok_or_else(|| anyhow!("invalid base64 character {:?}", c as char))?;
        accumulator = (accumulator << 6) | value;
        num_bits += 6;
        if num_bits >= 8 {
            num_bits -= 8;
            result.push((accumulator >> num_bits) as u8);
            accumulator &= (1 << num_bits) - 1;
        }
    }
    Ok(result)
}

fn sextet(c: u8) -> Option<u32> {
    let value = match c {
        b'A'..=b'Z' => c - b'A',
        b'a'..=b'z' => c - b'a' + 26,
        b'0'..=b'9' => c - b'0' + 52,
        b'-' => 62,
        b'_' => 63,
        _ => return None,
    };
    Some(value as u32)
}
