//! Per-account exclusive locks taken in one fixed order.
//!
//! Every caller sorts the keys it needs before acquiring, so two operations
//! touching the same accounts in opposite directions queue behind each other
//! instead of deadlocking. Acquisition shares one deadline across all keys
//! and gives up with `LockTimeout`.
//!
//! The map is process-local: with more than one service replica the version
//! checks in the store are what still catch conflicting writers.

use crate::error::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::warn;
use uuid::Uuid;

/// Sweep idle entries once the map grows past this many keys
const PRUNE_THRESHOLD: usize = 4096;

/// Lockable resource. The derived order (rules, then system accounts, then
/// wallets, each by id) is the global acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// Archive + insert of a (country, profile) rule version
    Rule(String),
    System(Uuid),
    Wallet(Uuid),
}

/// Guards held for the duration of one unit of work; dropping releases them
pub struct LockSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn len(&self) -> usize {
        self._guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self._guards.is_empty()
    }
}

pub struct LockManager {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire every key in sorted order, or none of them
    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> AppResult<LockSet> {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + self.timeout;
        let mut guards = Vec::with_capacity(keys.len());

        for key in keys {
            let slot = self.slot(&key)?;
            match timeout_at(deadline, slot.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    let waited_ms = self.timeout.as_millis() as u64;
                    warn!(?key, waited_ms, "Timed out waiting for account lock");
                    // guards acquired so far drop here
                    return Err(AppError::LockTimeout { waited_ms });
                }
            }
        }

        Ok(LockSet { _guards: guards })
    }

    fn slot(&self, key: &LockKey) -> AppResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AppError::Message("lock table poisoned".to_string()))?;

        if locks.len() > PRUNE_THRESHOLD {
            // Only the map holds an idle slot
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        }

        Ok(locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }
}
