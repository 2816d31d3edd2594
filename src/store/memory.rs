//! In-memory chain store.
//!
//! Used when no database is configured and as the store behind engine tests.
//! A commit is applied to a copy of the chain that replaces the live one only
//! once every change succeeded.

use crate::blockchain::Block;

use super::{ChainStore, Change, ChangeSet, Result, StoreError};

#[derive(Debug, Default)]
pub struct MemoryChainStore {
    blocks: Vec<Block>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply(blocks: &mut Vec<Block>, change: Change) -> Result<()> {
    match change {
        Change::Append(block) => {
            let expected = blocks.len() as u64;
            if block.position != expected {
                return Err(StoreError::OutOfOrder {
                    expected,
                    got: block.position,
                });
            }
            blocks.push(block);
        }
        Change::Update {
            block,
            expected_hash,
        } => {
            let position = block.position;
            let slot = usize::try_from(position)
                .ok()
                .and_then(|i| blocks.get_mut(i))
                .ok_or(StoreError::Missing { position })?;
            if slot.hash != expected_hash {
                return Err(StoreError::Conflict {
                    position,
                    expected: expected_hash,
                    found: slot.hash.clone(),
                });
            }
            *slot = block;
        }
        Change::InvalidateAfter(position) => {
            for block in blocks.iter_mut().filter(|b| b.position > position) {
                block.mined = false;
            }
        }
    }
    Ok(())
}

impl ChainStore for MemoryChainStore {
    fn load_all(&self) -> Result<Vec<Block>> {
        Ok(self.blocks.clone())
    }

    fn get(&self, position: u64) -> Result<Option<Block>> {
        Ok(usize::try_from(position)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .cloned())
    }

    fn last(&self) -> Result<Option<Block>> {
        Ok(self.blocks.last().cloned())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn commit(&mut self, changes: ChangeSet) -> Result<()> {
        let mut next = self.blocks.clone();
        for change in changes.changes {
            apply(&mut next, change)?;
        }
        self.blocks = next;
        Ok(())
    }
}
