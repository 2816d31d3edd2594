use actix_web::{HttpResponse, post, web};

use super::models::{ApiResponse, AppState, PreviewRequest, PreviewResponse};
use crate::blockchain::hasher::{canonical_string, compute_hash, is_valid_hash};

/// Hash arbitrary block fields with the engine's own hasher, for live previews
/// while a block is being edited. Nothing is stored.
#[post("/hash/preview")]
pub async fn preview_hash(
    state: web::Data<AppState>,
    body: web::Json<PreviewRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let hash = compute_hash(req.position, req.nonce, &req.payload, &req.prev_hash);
    HttpResponse::Ok().json(ApiResponse::ok(PreviewResponse {
        canonical: canonical_string(req.position, req.nonce, &req.payload, &req.prev_hash),
        valid: is_valid_hash(&hash, state.engine.difficulty()),
        hash,
    }))
}
