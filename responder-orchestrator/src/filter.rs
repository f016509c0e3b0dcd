//! Alert filter: severity first, then novelty
//!
//! The severity check is cheap and short-circuits before the store is
//! touched, so low/medium alerts never create dedup records.

use crate::models::{Alert, ThreatLevel};
use crate::store::{Admission, AlertStore};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Severity(ThreatLevel),
    Duplicate { last_seen: DateTime<Utc> },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Severity(level) => write!(f, "threat level {} below high", level),
            RejectReason::Duplicate { last_seen } => {
                write!(f, "duplicate of alert seen at {}", last_seen.to_rfc3339())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

#[cfg(test)]
impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

pub struct AlertFilter {
    store: Arc<dyn AlertStore>,
    window: Duration,
}

impl AlertFilter {
    pub fn new(store: Arc<dyn AlertStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Decide on `alert`; an accepted alert is already recorded in the store
    pub fn evaluate(&self, alert: &Alert, now: DateTime<Utc>) -> Decision {
        if !alert.threat_level.is_actionable() {
            return Decision::Reject(RejectReason::Severity(alert.threat_level));
        }

        match self.store.admit(&alert.dedup_key(), now, self.window) {
            Admission::Novel => Decision::Accept,
            Admission::Duplicate { last_seen } => {
                Decision::Reject(RejectReason::Duplicate { last_seen })
            }
        }
    }
}
