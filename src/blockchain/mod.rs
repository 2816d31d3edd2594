pub mod block;
pub mod engine;
pub mod hasher;
pub mod miner;

pub use block::Block;
pub use engine::ChainEngine;
pub use miner::{AbortReason, CancelToken};

/// Default Proof-of-Work difficulty (number of leading zero hex digits).
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// Upper bound for difficulty: a SHA-256 digest has 64 hex digits.
pub const MAX_DIFFICULTY: u32 = 64;

/// Field separator of the canonical string. Changing it invalidates every
/// stored hash.
pub const HASH_SEPARATOR: char = '|';

/// Payload the genesis block is seeded with.
pub const GENESIS_PAYLOAD: &str = "Genesis Block";

/// How many nonces the miner tries between two cancellation checks.
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;
