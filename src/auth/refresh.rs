//! Opaque refresh token material
//!
//! A refresh token is 32 random bytes, hex-encoded (64 chars). Only an
//! Argon2id hash of it is stored, next to a short non-secret lookup key that
//! narrows which stored hashes have to be compared.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Raw refresh token length in bytes
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Hex chars of SHA-256(token) kept as lookup key
const LOOKUP_KEY_LEN: usize = 16;

/// Generate a new raw refresh token
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the lookup key for a raw token
pub fn lookup_key(raw_token: &str) -> String {
    let digest = Sha256::digest(raw_token.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(LOOKUP_KEY_LEN);
    key
}

/// Cheap shape check before any storage access
pub fn is_well_formed(raw_token: &str) -> bool {
    raw_token.len() == REFRESH_TOKEN_BYTES * 2 && raw_token.bytes().all(|b| b.is_ascii_hexdigit())
}
