//! Chain persistence.
//!
//! The engine never touches storage directly: it reads through [`ChainStore`]
//! and writes by committing a [`ChangeSet`], which a store applies all or
//! nothing. `Update` changes carry the hash the engine saw when it planned
//! them; a store refuses the whole set if the stored hash moved since.
//!
//! - [`MemoryChainStore`] - volatile, also the test double
//! - [`SqliteChainStore`] - durable, one SQL transaction per commit

pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::blockchain::Block;

pub use memory::MemoryChainStore;
pub use sqlite::SqliteChainStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The stored block changed after the change set was planned.
    #[error("conflict at block {position}: expected hash {expected:?}, found {found:?}")]
    Conflict {
        position: u64,
        expected: String,
        found: String,
    },

    #[error("block {position} does not exist")]
    Missing { position: u64 },

    #[error("append out of order: next position is {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("migration error: {0}")]
    Migration(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One write inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert a block at the tail; its position must equal the chain length.
    Append(Block),
    /// Overwrite the block at `block.position` if its stored hash is still
    /// `expected_hash`.
    Update { block: Block, expected_hash: String },
    /// Set `mined = false` on every block after the given position.
    InvalidateAfter(u64),
}

/// An ordered unit of work, committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, block: Block) -> Self {
        self.changes.push(Change::Append(block));
        self
    }

    pub fn update(mut self, block: Block, expected_hash: impl Into<String>) -> Self {
        self.changes.push(Change::Update {
            block,
            expected_hash: expected_hash.into(),
        });
        self
    }

    pub fn invalidate_after(mut self, position: u64) -> Self {
        self.changes.push(Change::InvalidateAfter(position));
        self
    }
}

/// Storage for the ordered block sequence.
///
/// Positions are dense from 0; blocks are never removed.
pub trait ChainStore: Send {
    /// All blocks, ascending by position.
    fn load_all(&self) -> Result<Vec<Block>>;

    fn get(&self, position: u64) -> Result<Option<Block>>;

    fn last(&self) -> Result<Option<Block>>;

    fn len(&self) -> Result<u64>;

    /// Apply every change or none of them.
    fn commit(&mut self, changes: ChangeSet) -> Result<()>;
}

impl<S: ChainStore + ?Sized> ChainStore for Box<S> {
    fn load_all(&self) -> Result<Vec<Block>> {
        (**self).load_all()
    }

    fn get(&self, position: u64) -> Result<Option<Block>> {
        (**self).get(position)
    }

    fn last(&self) -> Result<Option<Block>> {
        (**self).last()
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn commit(&mut self, changes: ChangeSet) -> Result<()> {
        (**self).commit(changes)
    }
}
