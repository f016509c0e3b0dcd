//! Alert store: durable record of which alert identities were already handled
//!
//! The store is the only place that decides novelty. `admit` performs the
//! window check and the upsert under one lock so two identical alerts racing
//! each other can never both be admitted.

use crate::models::DedupKey;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("dedup state IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt dedup state {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a novelty check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Key unseen or outside the window; the record now carries `now`
    Novel,
    /// Key seen within the window at `last_seen`
    Duplicate { last_seen: DateTime<Utc> },
}

/// Injectable dedup store
pub trait AlertStore: Send + Sync {
    /// Check `key` against the window and record it when novel, atomically
    fn admit(&self, key: &DedupKey, now: DateTime<Utc>, window: Duration) -> Admission;

    fn last_seen(&self, key: &DedupKey) -> Option<DateTime<Utc>>;

    fn len(&self) -> usize;

    /// Drop records that fell out of the window; they would be novel anyway
    fn prune(&self, now: DateTime<Utc>, window: Duration) -> usize;

    /// Write the current snapshot to durable storage
    fn persist(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DedupRecord {
    #[serde(flatten)]
    key: DedupKey,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<DedupRecord>,
    last_updated: DateTime<Utc>,
}

/// JSON-file backed store; `path: None` keeps everything in memory
pub struct JsonAlertStore {
    records: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    path: Option<PathBuf>,
}

impl JsonAlertStore {
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Load the snapshot at `path`, starting empty when it does not exist yet
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut records = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            if !content.trim().is_empty() {
                let snapshot: Snapshot =
                    serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                for record in snapshot.records {
                    let entry = records.entry(record.key).or_insert(record.last_seen);
                    if record.last_seen > *entry {
                        *entry = record.last_seen;
                    }
                }
            }
            info!("loaded {} dedup records from {}", records.len(), path.display());
        } else {
            info!("no dedup state at {}, starting fresh", path.display());
        }

        Ok(Self {
            records: Mutex::new(records),
            path: Some(path),
        })
    }
}

impl AlertStore for JsonAlertStore {
    fn admit(&self, key: &DedupKey, now: DateTime<Utc>, window: Duration) -> Admission {
        let mut records = self.records.lock();
        if let Some(last_seen) = records.get(key).copied() {
            if within_window(last_seen, now, window) {
                return Admission::Duplicate { last_seen };
            }
        }
        let entry = records.entry(key.clone()).or_insert(now);
        // last_seen never moves backwards, even if the clock does
        if now > *entry {
            *entry = now;
        }
        Admission::Novel
    }

    fn last_seen(&self, key: &DedupKey) -> Option<DateTime<Utc>> {
        self.records.lock().get(key).copied()
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }

    fn prune(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, last_seen| within_window(*last_seen, now, window));
        let removed = before - records.len();
        if removed > 0 {
            debug!("pruned {} expired dedup records", removed);
        }
        removed
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = {
            let records = self.records.lock();
            let mut records: Vec<DedupRecord> = records
                .iter()
                .map(|(key, last_seen)| DedupRecord {
                    key: key.clone(),
                    last_seen: *last_seen,
                })
                .collect();
            records.sort_by(|a, b| a.key.cmp(&b.key));
            Snapshot {
                records,
                last_updated: Utc::now(),
            }
        };

        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(&snapshot).map_err(|source| {
            StoreError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        // write-then-rename so a crash never leaves a half-written snapshot
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

fn within_window(last_seen: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now - last_seen < window,
        Err(_) => true,
    }
}
