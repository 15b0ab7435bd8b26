//! API key minting and hashing.
//!
//! Plaintext keys are shown to the caller exactly once at creation time;
//! only the SHA-256 hex digest is ever persisted or looked up.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_PREFIX: &str = "bm_";

#[derive(Debug, Error)]
#[error("system randomness unavailable: {0}")]
pub struct RandomnessError(getrandom::Error);

/// Mint a new plaintext API key: `bm_` + 32 url-safe characters.
pub fn new_api_key() -> Result<String, RandomnessError> {
    let mut buf = [0u8; 24];
    getrandom::fill(&mut buf).map_err(RandomnessError)?;
    Ok(format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(buf)))
}

/// Random identifier with a type prefix, e.g. `inv_4fz…`.
pub fn new_id(prefix: &str, random_bytes: usize) -> Result<String, RandomnessError> {
    let mut buf = vec![0u8; random_bytes];
    getrandom::fill(&mut buf).map_err(RandomnessError)?;
    Ok(format!("{prefix}{}", URL_SAFE_NO_PAD.encode(&buf)))
}

/// SHA-256 hex digest of a plaintext key. Lookup key for accounts.
pub fn hash_key(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex(&digest)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
        out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
    }
    out
}
