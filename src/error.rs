use thiserror::Error;

use crate::blockchain::AbortReason;
use crate::store::StoreError;

/// Errors surfaced by chain operations. All of them are per-request.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block {position} not found")]
    NotFound { position: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("integrity inconsistency at block {position}: {reason}")]
    IntegrityInconsistency { position: u64, reason: String },

    /// The block changed while the operation was in flight.
    #[error("block {position} was modified concurrently, retry the operation")]
    Conflict { position: u64 },

    #[error("block {position} is already being mined")]
    MiningInProgress { position: u64 },

    #[error("mining block {position} {reason}")]
    MiningAborted { position: u64, reason: AbortReason },

    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { position, .. } => ChainError::Conflict { position },
            other => ChainError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
