//! Brute-force Proof-of-Work search.
//!
//! The search walks nonces upward from zero, so for fixed inputs it always
//! lands on the smallest valid nonce. It is interruptible through a
//! [`CancelToken`], polled every [`CANCEL_CHECK_INTERVAL`] nonces.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use super::CANCEL_CHECK_INTERVAL;
use super::hasher::{compute_hash, is_valid_hash};

/// Shared abort signal for an in-flight search. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Signal every holder of this token to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Why the search should stop now, if it should.
    pub fn check(&self) -> Option<AbortReason> {
        if self.is_cancelled() {
            return Some(AbortReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(AbortReason::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    TimedOut,
    /// Every `u64` nonce was tried.
    Exhausted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::Cancelled => "cancelled",
            AbortReason::TimedOut => "timed out",
            AbortReason::Exhausted => "nonce space exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    Found(Solution),
    Aborted { reason: AbortReason, attempts: u64 },
}

/// Find the smallest nonce whose hash meets `difficulty`.
pub fn search(
    position: u64,
    payload: &str,
    prev_hash: &str,
    difficulty: u32,
    cancel: &CancelToken,
) -> MineOutcome {
    let mut nonce: u64 = 0;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 {
            if let Some(reason) = cancel.check() {
                debug!("MINER - block #{position} aborted ({reason}) after {nonce} attempts");
                return MineOutcome::Aborted {
                    reason,
                    attempts: nonce,
                };
            }
        }

        let hash = compute_hash(position, nonce, payload, prev_hash);
        if is_valid_hash(&hash, difficulty) {
            debug!("MINER - block #{position} solved at nonce={nonce}");
            return MineOutcome::Found(Solution { nonce, hash });
        }

        nonce = match nonce.checked_add(1) {
            Some(next) => next,
            None => {
                return MineOutcome::Aborted {
                    reason: AbortReason::Exhausted,
                    attempts: u64::MAX,
                };
            }
        };
    }
}
