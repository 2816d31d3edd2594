use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::GENESIS_PAYLOAD;
use super::hasher::{compute_hash, is_valid_hash};

/// A single block of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub position: u64,
    pub nonce: u64,
    pub payload: String,
    pub prev_hash: String, // empty for the genesis block
    pub hash: String,      // derived, see `rehash`
    pub mined: bool,       // derived, see `rehash`
    pub created_at: i64,   // Unix timestamp (UTC), not hashed
}

impl Block {
    /// Create the genesis block. It starts unhashed and unmined.
    pub fn genesis() -> Self {
        let mut block = Self::new(0, String::new());
        block.payload = GENESIS_PAYLOAD.to_string();
        block
    }

    /// Create an empty block linked to `prev_hash`. Call `rehash()` or mine it
    /// to give it a hash.
    pub fn new(position: u64, prev_hash: String) -> Self {
        Self {
            position,
            nonce: 0,
            payload: String::new(),
            prev_hash,
            hash: String::new(),
            mined: false,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Canonical hash of the block's current fields (excluding `hash` itself).
    pub fn compute_hash(&self) -> String {
        compute_hash(self.position, self.nonce, &self.payload, &self.prev_hash)
    }

    /// Recompute `hash` and `mined` from the current fields.
    pub fn rehash(&mut self, difficulty: u32) {
        self.hash = self.compute_hash();
        self.mined = is_valid_hash(&self.hash, difficulty);
    }
}
