//! Cursor authentication header material
//!
//! The API authenticates each request with a rolling-cipher checksum plus
//! two token-derived identifiers:
//!
//! - `x-cursor-checksum`: the jyh cipher over a coarse timestamp, suffixed
//!   with the connection's machine id
//! - `x-client-key`: sha256 hex of the cleaned access token
//! - `x-session-id`: UUIDv5 of the cleaned access token in the DNS namespace
//!
//! Tokens imported from Cursor carry a `workos::` style prefix separated by
//! `::`; only the part after the separator is the bearer token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Initial cipher key.
const JYH_SEED: u8 = 165;

/// Encode a 48-bit value with the jyh rolling cipher.
///
/// Writes the value as 6 big-endian bytes, applies
/// `b[i] = ((b[i] XOR k) + (i mod 256)) & 0xFF; k = b[i]` with `k` seeded to
/// 165, then URL-safe base64 without padding. Deterministic for a fixed
/// input.
pub fn jyh_encode(value: u64) -> String {
    let be = value.to_be_bytes();
    let mut bytes: [u8; 6] = be[2..8].try_into().expect("6-byte slice");

    let mut key = JYH_SEED;
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = (*byte ^ key).wrapping_add((i % 256) as u8);
        key = *byte;
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the `x-cursor-checksum` value for a request.
///
/// The timestamp is coarsened to `floor(ms / 1e6)` — roughly 16-minute
/// buckets — before ciphering, then the machine id is appended verbatim.
pub fn cursor_checksum(timestamp_ms: u64, machine_id: &str) -> String {
    format!("{}{}", jyh_encode(timestamp_ms / 1_000_000), machine_id)
}

/// Strip the `prefix::` wrapper some imported tokens carry.
pub fn clean_token(access_token: &str) -> &str {
    match access_token.split_once("::") {
        Some((_, token)) => token,
        None => access_token,
    }
}

/// `x-client-key`: sha256 hex digest of the cleaned token.
pub fn client_key(access_token: &str) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(clean_token(access_token).as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        write!(hex, "{byte:02x}").expect("write to String");
    }
    hex
}

/// `x-session-id`: UUIDv5 of the cleaned token in the DNS namespace.
pub fn session_id(access_token: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, clean_token(access_token).as_bytes()).to_string()
}
