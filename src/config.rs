use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::blockchain::{DEFAULT_DIFFICULTY, MAX_DIFFICULTY};

/// Default upper bound on a single mine request.
pub const DEFAULT_MINE_TIMEOUT_SECS: u64 = 30;

/// Process settings, read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub difficulty: u32,
    /// SQLite file; `None` keeps the chain in memory.
    pub database_path: Option<PathBuf>,
    /// `None` lets a mine request run until it finds a nonce or is cancelled.
    pub mine_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key/value source. Bad values fall back to
    /// their default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&lookup, "PORT", 8080u16);

        let mut difficulty = parse_or(&lookup, "DIFFICULTY", DEFAULT_DIFFICULTY);
        if difficulty > MAX_DIFFICULTY {
            warn!("DIFFICULTY={difficulty} is above {MAX_DIFFICULTY}, using {DEFAULT_DIFFICULTY}");
            difficulty = DEFAULT_DIFFICULTY;
        }

        let database_path = lookup("DATABASE_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let mine_timeout = match parse_or(&lookup, "MINE_TIMEOUT_SECS", DEFAULT_MINE_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Self {
            host,
            port,
            difficulty,
            database_path,
            mine_timeout,
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using {default}");
            default
        }),
    }
}
