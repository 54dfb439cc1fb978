//! Token generation, hashing, and comparison helpers.
//!
//! Raw tokens are only ever returned to the caller that must present them;
//! storage and comparison always work on SHA-256 hashes.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Create a new opaque token (32 random bytes, base64-url encoded).
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token so raw values never touch the database.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Constant-time token equality.
///
/// Both sides are reduced to SHA-256 digests first, so comparison cost is
/// independent of input length and of where the first difference occurs.
pub(crate) fn tokens_match(a: &str, b: &str) -> bool {
    digests_match(&hash_token(a), &hash_token(b))
}

/// Constant-time equality of two SHA-256 digests.
pub(crate) fn digests_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
