mod api;
mod blockchain;
mod config;
mod error;
mod store;

use std::io;

use actix_web::{App, HttpServer, web};
use dotenvy::dotenv;
use log::{info, warn};

use api::AppState;
use blockchain::ChainEngine;
use config::Config;
use store::{ChainStore, MemoryChainStore, SqliteChainStore};

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _ = dotenv();
    env_logger::init();

    let cfg = Config::from_env();

    let store: Box<dyn ChainStore> = match &cfg.database_path {
        Some(path) => {
            info!("[DB] opening {}", path.display());
            Box::new(SqliteChainStore::open(path).map_err(io::Error::other)?)
        }
        None => {
            warn!("DATABASE_PATH not set, the chain lives in memory only");
            Box::new(MemoryChainStore::new())
        }
    };
    let engine = ChainEngine::open(store, cfg.difficulty).map_err(io::Error::other)?;

    println!(
        "⛓️ Starting proof chain API at http://{}:{} (difficulty {})",
        cfg.host, cfg.port, cfg.difficulty
    );

    let state = web::Data::new(AppState::new(engine, cfg.mine_timeout));

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::init_routes)
    })
    .bind((cfg.host.as_str(), cfg.port))?
    .run()
    .await
}
