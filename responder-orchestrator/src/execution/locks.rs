//! Per-pair mutual exclusion
//!
//! A unit holds one lock per distinct (source, destination) pair among its
//! alerts from CONNECTING until its terminal record. Locks are always taken
//! in sorted order so two units with overlapping pair sets cannot deadlock.

use crate::models::PairKey;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held pair locks; released on drop
pub struct PairGuard {
    pairs: Vec<PairKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl PairGuard {
    pub fn pairs(&self) -> &[PairKey] {
        &self.pairs
    }
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every pair in `pairs` is free and take them all
    pub async fn acquire<I>(&self, pairs: I) -> PairGuard
    where
        I: IntoIterator<Item = PairKey>,
    {
        let ordered: BTreeSet<PairKey> = pairs.into_iter().collect();
        let handles: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut locks = self.locks.lock();
            // forget idle entries so the map tracks only pairs seen recently
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            ordered
                .iter()
                .map(|pair| locks.entry(pair.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        PairGuard {
            pairs: ordered.into_iter().collect(),
            _guards: guards,
        }
    }

    /// True when some unit currently holds `pair`
    #[cfg(test)]
    pub fn is_held(&self, pair: &PairKey) -> bool {
        self.locks
            .lock()
            .get(pair)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
