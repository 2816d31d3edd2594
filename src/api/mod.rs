mod blocks;
mod health;
pub mod models;
mod preview;

use actix_web::error::InternalError;
use actix_web::web::{self, ServiceConfig};
use actix_web::{Error, ResponseError};

use crate::error::ChainError;

pub use models::AppState;

pub fn init_routes(cfg: &mut ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .app_data(json_config())
            .app_data(query_config())
            .service(health::health_check)
            .service(blocks::list_blocks)
            .service(blocks::verify_chain) // before /blocks/{id}
            .service(blocks::get_block)
            .service(blocks::append_block)
            .service(blocks::edit_block)
            .service(blocks::mine_block)
            .service(blocks::cancel_mining)
            .service(preview::preview_hash),
    );
}

/// Malformed or incomplete bodies come back as an `InvalidInput` envelope.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = ChainError::InvalidInput(err.to_string()).error_response();
        Error::from(InternalError::from_response(err, response))
    })
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        let response = ChainError::InvalidInput(err.to_string()).error_response();
        Error::from(InternalError::from_response(err, response))
    })
}

fn parse_position(raw: &str) -> Result<u64, ChainError> {
    raw.trim()
        .parse()
        .map_err(|_| ChainError::InvalidInput(format!("invalid block position {raw:?}")))
}
