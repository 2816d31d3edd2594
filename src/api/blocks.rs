use actix_web::{HttpResponse, delete, get, post, put, web};
use log::{debug, error, info};

use super::models::{ApiResponse, AppState, CancelResponse, EditBlockRequest, VerifyQuery};
use super::parse_position;
use crate::blockchain::CancelToken;
use crate::error::{ChainError, Result};

/// List every block, ascending by position.
#[get("/blocks")]
pub async fn list_blocks(state: web::Data<AppState>) -> Result<HttpResponse> {
    let blocks = state.engine.blocks()?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(blocks)))
}

/// Check hashes, links and mined flags across the whole chain.
#[get("/blocks/verify")]
pub async fn verify_chain(
    state: web::Data<AppState>,
    query: web::Query<VerifyQuery>,
) -> Result<HttpResponse> {
    let report = if query.strict {
        state.engine.ensure_valid()?
    } else {
        state.engine.verify()?
    };
    Ok(HttpResponse::Ok().json(ApiResponse::ok(report)))
}

#[get("/blocks/{id}")]
pub async fn get_block(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let position = parse_position(&path)?;
    let block = state.engine.block(position)?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(block)))
}

/// Append an empty block linked to the current last hash.
#[post("/blocks")]
pub async fn append_block(state: web::Data<AppState>) -> Result<HttpResponse> {
    let block = state.engine.append()?;
    Ok(HttpResponse::Created().json(ApiResponse::ok(block)))
}

/// Edit nonce/payload; every later block is flagged unmined.
#[put("/blocks/{id}")]
pub async fn edit_block(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<EditBlockRequest>,
) -> Result<HttpResponse> {
    let position = parse_position(&path)?;
    let EditBlockRequest { nonce, payload } = body.into_inner();
    debug!("PUT /blocks/{position} - nonce={nonce}, payload={} bytes", payload.len());

    let block = state.engine.edit(position, nonce, payload)?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(block)))
}

/// An entry in the mining registry. Dropping it cancels the search and frees
/// the position, also when the client goes away mid-request.
struct MiningJob {
    state: web::Data<AppState>,
    position: u64,
    token: CancelToken,
}

impl MiningJob {
    fn start(state: web::Data<AppState>, position: u64) -> Result<Self> {
        let token = match state.mine_timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };
        {
            let mut jobs = state.jobs();
            if jobs.contains_key(&position) {
                return Err(ChainError::MiningInProgress { position });
            }
            jobs.insert(position, token.clone());
        }
        Ok(Self {
            state,
            position,
            token,
        })
    }
}

impl Drop for MiningJob {
    fn drop(&mut self) {
        // The worker may still hash until its next token check, so a new job
        // for this position can overlap it. The loser's commit is refused with
        // `Conflict` or `MiningAborted`.
        self.token.cancel();
        self.state.jobs().remove(&self.position);
    }
}

/// Run Proof-of-Work on a block, off the request workers.
#[post("/blocks/{id}/mine")]
pub async fn mine_block(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let position = parse_position(&path)?;
    let job = MiningJob::start(state.clone(), position)?;

    let token = job.token.clone();
    let worker = state.clone();
    let outcome = web::block(move || worker.engine.mine(position, &token)).await;
    drop(job);

    match outcome {
        Ok(result) => Ok(HttpResponse::Ok().json(ApiResponse::ok(result?))),
        Err(err) => {
            error!("MINER - worker for block #{position} failed: {err}");
            Ok(HttpResponse::InternalServerError().json(ApiResponse::failure("mining worker failed")))
        }
    }
}

/// Abort an in-flight mine request for a block.
#[delete("/blocks/{id}/mine")]
pub async fn cancel_mining(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let position = parse_position(&path)?;
    let cancelled = match state.jobs().get(&position) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    info!("MINER - cancel requested for block #{position} (in flight: {cancelled})");
    Ok(HttpResponse::Ok().json(ApiResponse::ok(CancelResponse {
        position,
        cancelled,
    })))
}
