//! Chain integrity engine.
//!
//! Applies append / edit / mine to a [`ChainStore`] and keeps the hash
//! linkage honest:
//!
//! - `edit(k)` rehashes block `k` and flags every later block unmined. Their
//!   stored `hash`/`prev_hash` are left alone (lazy invalidation).
//! - `mine(k)` seals block `k`, relinks and rehashes block `k + 1`, and if
//!   that successor no longer meets the difficulty flags everything after it.
//!
//! Each operation commits a single [`ChangeSet`], so readers see the chain
//! either before or after the whole cascade. Mining searches without holding
//! the store lock and commits against the hash it started from; if the block
//! moved in the meantime the commit is refused with [`ChainError::Conflict`].

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::Serialize;

use super::hasher::is_valid_hash;
use super::miner::{self, CancelToken, MineOutcome, Solution};
use super::{Block, MAX_DIFFICULTY};
use crate::error::{ChainError, Result};
use crate::store::{ChainStore, ChangeSet, StoreError};

/// A freshly mined block and the positions its cascade flagged unmined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MineResult {
    pub block: Block,
    pub invalidated: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The genesis block points at a predecessor.
    GenesisLink,
    /// Stored hash differs from the hash of the stored fields.
    StaleHash,
    /// `prev_hash` differs from the predecessor's stored hash.
    BrokenLink,
    Unmined,
    /// Flagged mined but the hash misses the difficulty.
    FlagMismatch,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueKind::GenesisLink => "genesis block has a previous hash",
            IssueKind::StaleHash => "stored hash does not match block contents",
            IssueKind::BrokenLink => "previous hash does not match predecessor",
            IssueKind::Unmined => "block is not mined",
            IssueKind::FlagMismatch => "block is flagged mined but fails the difficulty",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub position: u64,
    pub kind: IssueKind,
}

/// Result of walking the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    pub length: u64,
    pub difficulty: u32,
    pub issues: Vec<Issue>,
}

pub struct ChainEngine<S> {
    store: Mutex<S>,
    difficulty: u32,
}

impl<S: ChainStore> ChainEngine<S> {
    /// Wrap `store`, seeding the genesis block if it is empty.
    pub fn open(mut store: S, difficulty: u32) -> Result<Self> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ChainError::InvalidInput(format!(
                "difficulty {difficulty} exceeds {MAX_DIFFICULTY}"
            )));
        }
        if store.len()? == 0 {
            store.commit(ChangeSet::new().append(Block::genesis()))?;
            info!("Genesis block seeded");
        }
        Ok(Self {
            store: Mutex::new(store),
            difficulty,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>> {
        self.store
            .lock()
            .map_err(|_| ChainError::Storage(StoreError::Poisoned))
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// All blocks, ascending by position.
    pub fn blocks(&self) -> Result<Vec<Block>> {
        Ok(self.lock()?.load_all()?)
    }

    pub fn block(&self, position: u64) -> Result<Block> {
        self.lock()?
            .get(position)?
            .ok_or(ChainError::NotFound { position })
    }

    /// Append an empty, unmined block linked to the current last hash.
    pub fn append(&self) -> Result<Block> {
        let mut store = self.lock()?;
        let last = store
            .last()?
            .ok_or_else(|| ChainError::IntegrityInconsistency {
                position: 0,
                reason: "chain has no genesis block".into(),
            })?;

        let block = Block::new(last.position + 1, last.hash);
        store.commit(ChangeSet::new().append(block.clone()))?;
        info!(
            "APPEND - block #{} linked to {:?}",
            block.position, block.prev_hash
        );
        Ok(block)
    }

    /// Set a block's nonce and payload, rehash it, and flag every later block
    /// unmined.
    pub fn edit(&self, position: u64, nonce: u64, payload: String) -> Result<Block> {
        let mut store = self.lock()?;
        let current = store
            .get(position)?
            .ok_or(ChainError::NotFound { position })?;
        let len = store.len()?;

        let mut block = current.clone();
        block.nonce = nonce;
        block.payload = payload;
        block.rehash(self.difficulty);

        store.commit(
            ChangeSet::new()
                .update(block.clone(), current.hash)
                .invalidate_after(position),
        )?;
        debug!(
            "EDIT - block #{position} nonce={nonce} mined={} ({} later block(s) flagged unmined)",
            block.mined,
            len.saturating_sub(position + 1)
        );
        Ok(block)
    }

    /// Mine a block, repair its successor's link, and cascade if needed.
    ///
    /// The search runs without the store lock. On cancellation nothing is
    /// written.
    pub fn mine(&self, position: u64, cancel: &CancelToken) -> Result<MineResult> {
        let snapshot = self.block(position)?;

        let solution = match miner::search(
            position,
            &snapshot.payload,
            &snapshot.prev_hash,
            self.difficulty,
            cancel,
        ) {
            MineOutcome::Found(solution) => solution,
            MineOutcome::Aborted { reason, attempts } => {
                warn!("MINER - block #{position} {reason} after {attempts} attempts");
                return Err(ChainError::MiningAborted { position, reason });
            }
        };

        self.commit_solution(snapshot, solution, cancel)
    }

    /// Write a solution found for `snapshot`, refusing it if the block's hash
    /// moved since the snapshot was taken or `cancel` fired after the search.
    fn commit_solution(
        &self,
        snapshot: Block,
        solution: Solution,
        cancel: &CancelToken,
    ) -> Result<MineResult> {
        let position = snapshot.position;
        let mut store = self.lock()?;

        // checked under the lock: once this passes, the commit is not cancellable
        if let Some(reason) = cancel.check() {
            warn!("MINER - block #{position} {reason} before commit, solution discarded");
            return Err(ChainError::MiningAborted { position, reason });
        }

        let expected_hash = snapshot.hash.clone();
        let mut block = snapshot;
        block.nonce = solution.nonce;
        block.hash = solution.hash;
        block.mined = true;

        let mut changes = ChangeSet::new().update(block.clone(), expected_hash);
        let mut invalidated = Vec::new();

        if let Some(next) = store.get(position + 1)? {
            let mut repaired = next.clone();
            repaired.prev_hash = block.hash.clone();
            repaired.rehash(self.difficulty);
            changes = changes.update(repaired.clone(), next.hash);

            if !repaired.mined {
                let len = store.len()?;
                invalidated.push(repaired.position);
                invalidated.extend(repaired.position + 1..len);
                changes = changes.invalidate_after(repaired.position);
            }
        }

        if let Err(err) = store.commit(changes) {
            let err = ChainError::from(err);
            if let ChainError::Conflict { position } = &err {
                warn!("MINER - block #{position} changed while mining, solution discarded");
            }
            return Err(err);
        }

        info!(
            "MINER - sealed block #{} (hash={}, nonce={}, invalidated={:?})",
            block.position, block.hash, block.nonce, invalidated
        );
        Ok(MineResult { block, invalidated })
    }

    /// Walk the chain and report every broken invariant.
    pub fn verify(&self) -> Result<ChainReport> {
        let blocks = self.blocks()?;
        let mut issues = Vec::new();

        let mut prev: Option<&Block> = None;
        for block in &blocks {
            let position = block.position;
            let linked = match prev {
                None => block.prev_hash.is_empty(),
                Some(p) => block.prev_hash == p.hash,
            };
            if !linked {
                let kind = if prev.is_none() {
                    IssueKind::GenesisLink
                } else {
                    IssueKind::BrokenLink
                };
                issues.push(Issue { position, kind });
            }
            if block.hash != block.compute_hash() {
                issues.push(Issue {
                    position,
                    kind: IssueKind::StaleHash,
                });
            }
            if !block.mined {
                issues.push(Issue {
                    position,
                    kind: IssueKind::Unmined,
                });
            } else if !is_valid_hash(&block.hash, self.difficulty) {
                issues.push(Issue {
                    position,
                    kind: IssueKind::FlagMismatch,
                });
            }
            prev = Some(block);
        }

        Ok(ChainReport {
            valid: issues.is_empty(),
            length: blocks.len() as u64,
            difficulty: self.difficulty,
            issues,
        })
    }

    /// Like [`verify`](Self::verify), but fails on the first issue.
    pub fn ensure_valid(&self) -> Result<ChainReport> {
        let report = self.verify()?;
        match report.issues.first() {
            Some(issue) => Err(ChainError::IntegrityInconsistency {
                position: issue.position,
                reason: issue.kind.to_string(),
            }),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::AbortReason;
    use crate::blockchain::hasher::compute_hash;
    use crate::store::{MemoryChainStore, SqliteChainStore};

    const GENESIS_D1: &str = "05d2893752206651a1dbc853d05624b7797de207d8dde8260d5f9adda2553601";
    const GENESIS_D2: &str = "00df25a4eaabfb73f10f467c39a1b10338025b6f628fe5cdf96bc646ae32bace";

    fn engine(difficulty: u32) -> ChainEngine<MemoryChainStore> {
        ChainEngine::open(MemoryChainStore::new(), difficulty).unwrap()
    }

    fn with_blocks(difficulty: u32, n: u64) -> ChainEngine<MemoryChainStore> {
        let engine = engine(difficulty);
        for _ in 1..n {
            engine.append().unwrap();
        }
        engine
    }

    fn mine_all(engine: &ChainEngine<MemoryChainStore>) {
        let len = engine.blocks().unwrap().len() as u64;
        for position in 0..len {
            engine.mine(position, &CancelToken::new()).unwrap();
        }
    }

    #[test]
    fn open_seeds_genesis_once() {
        let engine = engine(4);
        let blocks = engine.blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].payload, "Genesis Block");
        assert!(blocks[0].prev_hash.is_empty());
        assert!(!blocks[0].mined);

        let mut store = MemoryChainStore::new();
        store
            .commit(ChangeSet::new().append(blocks[0].clone()))
            .unwrap();
        let reopened = ChainEngine::open(store, 4).unwrap();
        assert_eq!(reopened.blocks().unwrap(), blocks);
    }

    #[test]
    fn open_rejects_impossible_difficulty() {
        let err = ChainEngine::open(MemoryChainStore::new(), 65).err().unwrap();
        assert!(matches!(err, ChainError::InvalidInput(_)));
    }

    #[test]
    fn append_links_to_last_hash_without_touching_chain() {
        let engine = engine(1);
        engine.mine(0, &CancelToken::new()).unwrap();
        let before = engine.blocks().unwrap();

        let block = engine.append().unwrap();
        assert_eq!(block.position, 1);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.payload, "");
        assert_eq!(block.prev_hash, GENESIS_D1);
        assert_eq!(block.hash, "");
        assert!(!block.mined);

        let after = engine.blocks().unwrap();
        assert_eq!(&after[..1], &before[..]);
        assert_eq!(after[1], block);
    }

    #[test]
    fn append_after_unmined_genesis_copies_empty_hash() {
        let engine = engine(1);
        let block = engine.append().unwrap();
        assert_eq!(block.prev_hash, "");
    }

    #[test]
    fn edit_rehashes_and_flags_later_blocks() {
        let engine = with_blocks(1, 4);
        mine_all(&engine);
        let before = engine.blocks().unwrap();
        assert!(before.iter().all(|b| b.mined));

        let edited = engine.edit(1, 99, "changed".into()).unwrap();
        assert_eq!(edited.nonce, 99);
        assert_eq!(edited.payload, "changed");
        assert_eq!(edited.prev_hash, before[1].prev_hash);
        assert_eq!(
            edited.hash,
            compute_hash(1, 99, "changed", &before[1].prev_hash)
        );
        assert_eq!(edited.mined, edited.hash.starts_with('0'));

        let after = engine.blocks().unwrap();
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], edited);
        for (old, new) in before[2..].iter().zip(&after[2..]) {
            assert!(!new.mined);
            assert_eq!(new.hash, old.hash);
            assert_eq!(new.prev_hash, old.prev_hash);
            assert_eq!(new.nonce, old.nonce);
        }
    }

    #[test]
    fn edit_last_block_has_no_cascade() {
        let engine = with_blocks(1, 3);
        mine_all(&engine);
        let before = engine.blocks().unwrap();

        engine.edit(2, 5, "tail".into()).unwrap();
        let after = engine.blocks().unwrap();
        assert_eq!(&after[..2], &before[..2]);
    }

    #[test]
    fn edit_unknown_block_is_not_found() {
        let engine = engine(1);
        let err = engine.edit(3, 0, String::new()).unwrap_err();
        assert!(matches!(err, ChainError::NotFound { position: 3 }));
    }

    #[test]
    fn scenario_difficulty_one() {
        let engine = engine(1);
        let appended = engine.append().unwrap();
        assert_eq!(appended.prev_hash, "");

        let genesis = engine.edit(0, 0, "Genesis Block".into()).unwrap();
        assert_eq!(
            genesis.hash,
            "77976fd27848a76c44a44c1ee47e9e19b086135363d6f5f0a38ed74ef8fa32b0"
        );
        assert!(!genesis.mined);

        let result = engine.mine(0, &CancelToken::new()).unwrap();
        assert_eq!(result.block.nonce, 2);
        assert_eq!(result.block.hash, GENESIS_D1);
        assert!(result.block.mined);

        let successor = engine.block(1).unwrap();
        assert_eq!(successor.prev_hash, GENESIS_D1);
        assert_eq!(
            successor.hash,
            "040e75ba01885fcbc360bfe37083d6b276da35d524aafd0b5a5ed0171dace1f6"
        );
        // the relinked successor happens to meet difficulty 1
        assert!(successor.mined);
        assert!(result.invalidated.is_empty());
    }

    #[test]
    fn scenario_difficulty_two_cascades() {
        let engine = with_blocks(2, 3);
        let result = engine.mine(0, &CancelToken::new()).unwrap();
        assert_eq!(result.block.nonce, 154);
        assert_eq!(result.block.hash, GENESIS_D2);

        let blocks = engine.blocks().unwrap();
        assert_eq!(blocks[1].prev_hash, GENESIS_D2);
        assert_eq!(
            blocks[1].hash,
            "4db1a56c5eb6dc57bab37c9cb54dd4a74508b5c10237a32938584cbc8cfac9b2"
        );
        assert!(!blocks[1].mined);
        assert_eq!(result.invalidated, vec![1, 2]);

        // beyond the successor only the flag changes
        assert_eq!(blocks[2].prev_hash, "");
        assert_eq!(blocks[2].hash, "");
        assert!(!blocks[2].mined);
    }

    #[test]
    fn mine_relinks_successor_and_keeps_valid_suffix() {
        let engine = with_blocks(2, 4);
        mine_all(&engine);
        let before = engine.blocks().unwrap();

        // re-mining an untouched block changes nothing
        let result = engine.mine(1, &CancelToken::new()).unwrap();
        assert_eq!(result.block, before[1]);
        assert!(result.invalidated.is_empty());
        assert_eq!(engine.blocks().unwrap(), before);
    }

    #[test]
    fn mine_after_edit_restores_links_one_step_at_a_time() {
        let engine = with_blocks(2, 4);
        mine_all(&engine);
        engine.edit(1, 0, "rewritten".into()).unwrap();

        let result = engine.mine(1, &CancelToken::new()).unwrap();
        let blocks = engine.blocks().unwrap();
        assert!(blocks[1].mined);
        assert_eq!(blocks[2].prev_hash, blocks[1].hash);
        assert_eq!(blocks[2].hash, blocks[2].compute_hash());
        assert_eq!(blocks[2].mined, blocks[2].hash.starts_with("00"));
        if blocks[2].mined {
            assert!(result.invalidated.is_empty());
        } else {
            assert_eq!(result.invalidated, vec![2, 3]);
            assert!(!blocks[3].mined);
        }

        mine_all(&engine);
        assert!(engine.verify().unwrap().valid);
    }

    #[test]
    fn mining_twice_is_idempotent() {
        let engine = with_blocks(2, 2);
        let first = engine.mine(0, &CancelToken::new()).unwrap();
        let second = engine.mine(0, &CancelToken::new()).unwrap();
        assert_eq!(first.block.nonce, second.block.nonce);
        assert_eq!(first.block.hash, second.block.hash);
    }

    #[test]
    fn mining_last_block_invalidates_nothing() {
        let engine = with_blocks(1, 3);
        let result = engine.mine(2, &CancelToken::new()).unwrap();
        assert!(result.block.mined);
        assert!(result.invalidated.is_empty());
    }

    #[test]
    fn mining_unknown_block_is_not_found() {
        let engine = engine(1);
        let err = engine.mine(1, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ChainError::NotFound { position: 1 }));
    }

    #[test]
    fn cancelled_mining_leaves_chain_untouched() {
        let engine = with_blocks(1, 2);
        engine.edit(0, 7, "draft".into()).unwrap();
        let before = engine.blocks().unwrap();

        let token = CancelToken::new();
        token.cancel();
        let err = engine.mine(0, &token).unwrap_err();
        assert!(matches!(
            err,
            ChainError::MiningAborted {
                position: 0,
                reason: AbortReason::Cancelled
            }
        ));
        assert_eq!(engine.blocks().unwrap(), before);
    }

    #[test]
    fn solution_for_edited_block_is_refused() {
        let engine = with_blocks(1, 2);
        let snapshot = engine.block(0).unwrap();
        let solution = match miner::search(
            0,
            &snapshot.payload,
            &snapshot.prev_hash,
            1,
            &CancelToken::new(),
        ) {
            MineOutcome::Found(solution) => solution,
            other => panic!("unexpected {other:?}"),
        };

        // someone edits the block while the search runs
        engine.edit(0, 1, "concurrent".into()).unwrap();
        let before = engine.blocks().unwrap();

        let err = engine
            .commit_solution(snapshot, solution, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::Conflict { position: 0 }));
        assert_eq!(engine.blocks().unwrap(), before);
    }

    #[test]
    fn cancel_after_search_discards_solution() {
        let engine = with_blocks(2, 3);
        let before = engine.blocks().unwrap();
        let snapshot = engine.block(0).unwrap();

        let token = CancelToken::new();
        let solution = match miner::search(
            0,
            &snapshot.payload,
            &snapshot.prev_hash,
            2,
            &token,
        ) {
            MineOutcome::Found(solution) => solution,
            other => panic!("unexpected {other:?}"),
        };

        // the cancel lands between the search and the commit
        token.cancel();
        let err = engine
            .commit_solution(snapshot, solution, &token)
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::MiningAborted {
                position: 0,
                reason: AbortReason::Cancelled
            }
        ));
        assert_eq!(engine.blocks().unwrap(), before);
    }

    #[test]
    fn deadline_passed_after_search_discards_solution() {
        let engine = with_blocks(1, 2);
        let before = engine.blocks().unwrap();
        let snapshot = engine.block(0).unwrap();
        let solution = match miner::search(
            0,
            &snapshot.payload,
            &snapshot.prev_hash,
            1,
            &CancelToken::new(),
        ) {
            MineOutcome::Found(solution) => solution,
            other => panic!("unexpected {other:?}"),
        };

        let expired = CancelToken::with_timeout(std::time::Duration::ZERO);
        let err = engine
            .commit_solution(snapshot, solution, &expired)
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::MiningAborted {
                reason: AbortReason::TimedOut,
                ..
            }
        ));
        assert_eq!(engine.blocks().unwrap(), before);
    }

    #[test]
    fn full_range_nonce_is_stored_by_every_store() {
        let sqlite = ChainEngine::open(
            Box::new(SqliteChainStore::open_memory().unwrap()) as Box<dyn ChainStore>,
            1,
        )
        .unwrap();
        let memory =
            ChainEngine::open(Box::new(MemoryChainStore::new()) as Box<dyn ChainStore>, 1)
                .unwrap();

        for engine in [&sqlite, &memory] {
            engine.append().unwrap();
            let edited = engine.edit(0, u64::MAX, "x".into()).unwrap();
            assert_eq!(edited.nonce, u64::MAX);

            let stored = engine.block(0).unwrap();
            assert_eq!(stored, edited);
            assert_eq!(stored.hash, compute_hash(0, u64::MAX, "x", ""));
            assert!(!engine.block(1).unwrap().mined);
        }
    }

    #[test]
    fn verify_reports_fresh_and_broken_chains() {
        let engine = with_blocks(1, 2);
        let report = engine.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.length, 2);
        assert!(report.issues.contains(&Issue {
            position: 0,
            kind: IssueKind::StaleHash
        }));
        assert!(report.issues.contains(&Issue {
            position: 1,
            kind: IssueKind::Unmined
        }));

        mine_all(&engine);
        let report = engine.ensure_valid().unwrap();
        assert!(report.valid);
        assert!(report.issues.is_empty());

        engine.edit(0, 0, "Genesis Block".into()).unwrap();
        let report = engine.verify().unwrap();
        assert!(report.issues.contains(&Issue {
            position: 1,
            kind: IssueKind::BrokenLink
        }));
        let err = engine.ensure_valid().unwrap_err();
        assert!(matches!(
            err,
            ChainError::IntegrityInconsistency { position: 0, .. }
        ));
    }

    #[test]
    fn verify_flags_genesis_link_and_flag_mismatch() {
        let mut genesis = Block::genesis();
        genesis.prev_hash = "bogus".into();
        genesis.rehash(0);
        genesis.mined = true;
        let mut store = MemoryChainStore::new();
        store.commit(ChangeSet::new().append(genesis)).unwrap();

        let engine = ChainEngine::open(store, 64).unwrap();
        let kinds: Vec<IssueKind> = engine
            .verify()
            .unwrap()
            .issues
            .into_iter()
            .map(|i| i.kind)
            .collect();
        assert_eq!(kinds, vec![IssueKind::GenesisLink, IssueKind::FlagMismatch]);
    }
}
