use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde::{Deserialize, Serialize};

use crate::blockchain::{CancelToken, ChainEngine};
use crate::error::ChainError;
use crate::store::ChainStore;

/// Shared application state: the chain engine plus the in-flight mining jobs.
pub struct AppState {
    pub engine: ChainEngine<Box<dyn ChainStore>>,
    pub mining_jobs: Mutex<HashMap<u64, CancelToken>>,
    pub mine_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(engine: ChainEngine<Box<dyn ChainStore>>, mine_timeout: Option<Duration>) -> Self {
        Self {
            engine,
            mining_jobs: Mutex::new(HashMap::new()),
            mine_timeout,
        }
    }

    /// The registry only maps positions to tokens, so a poisoned lock is
    /// still usable.
    pub fn jobs(&self) -> MutexGuard<'_, HashMap<u64, CancelToken>> {
        self.mining_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/* ---------- Envelope ---------- */

/// Every response body: `{success, data}` or `{success: false, error}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl ResponseError for ChainError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChainError::NotFound { .. } => StatusCode::NOT_FOUND,
            ChainError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChainError::IntegrityInconsistency { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ChainError::Conflict { .. } | ChainError::MiningInProgress { .. } => {
                StatusCode::CONFLICT
            }
            ChainError::MiningAborted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ChainError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // storage details stay in the log
        let message = match self {
            ChainError::Storage(err) => {
                error!("[ERROR] {err}");
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ApiResponse::failure(message))
    }
}

/* ---------- Block API Models ---------- */

#[derive(Deserialize)]
pub struct EditBlockRequest {
    pub nonce: u64,
    pub payload: String,
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    /// Fail with an error envelope instead of returning an invalid report.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub position: u64,
    pub cancelled: bool,
}

/* ---------- Hash Preview Models ---------- */

#[derive(Deserialize)]
pub struct PreviewRequest {
    pub position: u64,
    pub nonce: u64,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub prev_hash: String,
}

#[derive(Serialize)]
pub struct PreviewResponse {
    pub canonical: String,
    pub hash: String,
    pub valid: bool,
}
