//! SQLite chain store.
//!
//! One row per block keyed by `position`. Every `commit` runs inside a single
//! SQL transaction; an error drops the transaction, which rolls it back.

use std::path::Path;

use log::info;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::blockchain::Block;

use super::{ChainStore, Change, ChangeSet, Result, StoreError};

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

const SELECT_BLOCK: &str =
    "SELECT position, nonce, payload, prev_hash, hash, mined, created_at FROM blocks";

pub struct SqliteChainStore {
    conn: Connection,
}

impl SqliteChainStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }
}

/// Create or upgrade the schema. Safe to call on every open.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < SCHEMA_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=SCHEMA_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, chrono::Utc::now().timestamp()],
            )?;
        }
        tx.commit()?;
        info!("[DB] schema migrated from v{current} to v{SCHEMA_VERSION}");
    }
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: u32) -> Result<()> {
    match version {
        1 => tx.execute_batch(
            "CREATE TABLE blocks (
                position   INTEGER PRIMARY KEY,
                nonce      INTEGER NOT NULL DEFAULT 0,
                payload    TEXT NOT NULL DEFAULT '',
                prev_hash  TEXT NOT NULL DEFAULT '',
                hash       TEXT NOT NULL DEFAULT '',
                mined      INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );",
        )?,
        _ => {
            return Err(StoreError::Migration(format!(
                "unknown migration version: {version}"
            )));
        }
    }
    Ok(())
}

// SQLite integers are signed 64-bit; nonces span all of `u64`, so they are
// stored bit-cast and read back the same way.
fn nonce_to_sql(nonce: u64) -> i64 {
    nonce as i64
}

fn nonce_from_sql(stored: i64) -> u64 {
    stored as u64
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    Ok(Block {
        position: row.get("position")?,
        nonce: nonce_from_sql(row.get("nonce")?),
        payload: row.get("payload")?,
        prev_hash: row.get("prev_hash")?,
        hash: row.get("hash")?,
        mined: row.get("mined")?,
        created_at: row.get("created_at")?,
    })
}

fn count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?)
}

fn apply(tx: &Transaction<'_>, change: Change) -> Result<()> {
    match change {
        Change::Append(block) => {
            let expected = count(tx)?;
            if block.position != expected {
                return Err(StoreError::OutOfOrder {
                    expected,
                    got: block.position,
                });
            }
            tx.execute(
                "INSERT INTO blocks (position, nonce, payload, prev_hash, hash, mined, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    block.position,
                    nonce_to_sql(block.nonce),
                    block.payload,
                    block.prev_hash,
                    block.hash,
                    block.mined,
                    block.created_at
                ],
            )?;
        }
        Change::Update {
            block,
            expected_hash,
        } => {
            let position = block.position;
            let found: String = tx
                .query_row(
                    "SELECT hash FROM blocks WHERE position = ?1",
                    params![position],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::Missing { position })?;
            if found != expected_hash {
                return Err(StoreError::Conflict {
                    position,
                    expected: expected_hash,
                    found,
                });
            }
            tx.execute(
                "UPDATE blocks SET nonce = ?1, payload = ?2, prev_hash = ?3, hash = ?4, mined = ?5
                 WHERE position = ?6",
                params![
                    nonce_to_sql(block.nonce),
                    block.payload,
                    block.prev_hash,
                    block.hash,
                    block.mined,
                    position
                ],
            )?;
        }
        Change::InvalidateAfter(position) => {
            tx.execute(
                "UPDATE blocks SET mined = 0 WHERE position > ?1",
                params![position],
            )?;
        }
    }
    Ok(())
}

impl ChainStore for SqliteChainStore {
    fn load_all(&self) -> Result<Vec<Block>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_BLOCK} ORDER BY position ASC"))?;
        let blocks = stmt
            .query_map([], row_to_block)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    fn get(&self, position: u64) -> Result<Option<Block>> {
        Ok(self
            .conn
            .query_row(
                &format!("{SELECT_BLOCK} WHERE position = ?1"),
                params![position],
                row_to_block,
            )
            .optional()?)
    }

    fn last(&self) -> Result<Option<Block>> {
        Ok(self
            .conn
            .query_row(
                &format!("{SELECT_BLOCK} ORDER BY position DESC LIMIT 1"),
                [],
                row_to_block,
            )
            .optional()?)
    }

    fn len(&self) -> Result<u64> {
        count(&self.conn)
    }

    fn commit(&mut self, changes: ChangeSet) -> Result<()> {
        let tx = self.conn.transaction()?;
        for change in changes.changes {
            apply(&tx, change)?;
        }
        tx.commit()?;
        Ok(())
    }
}
