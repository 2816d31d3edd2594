//! Canonical block hashing.
//!
//! Every digest in the system goes through [`compute_hash`]: the engine, the
//! miner and the `/hash/preview` endpoint share this one encoding, so a
//! preview can never disagree with what the engine stores.
//!
//! Encoding: `position|nonce|payload|prev_hash` as UTF-8, SHA-256, lowercase hex.

use sha2::{Digest, Sha256};

use super::HASH_SEPARATOR;

/// Build the canonical string hashed for a block.
pub fn canonical_string(position: u64, nonce: u64, payload: &str, prev_hash: &str) -> String {
    let sep = HASH_SEPARATOR;
    format!("{position}{sep}{nonce}{sep}{payload}{sep}{prev_hash}")
}

/// SHA-256 of the canonical string, hex encoded.
pub fn compute_hash(position: u64, nonce: u64, payload: &str, prev_hash: &str) -> String {
    let preimage = canonical_string(position, nonce, payload, prev_hash);
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

/// True iff the first `difficulty` hex digits of `hash` are all `'0'`.
pub fn is_valid_hash(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
