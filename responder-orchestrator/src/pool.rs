//! Pooling window
//!
//! With multi-alert disabled every accepted alert becomes its own batch.
//! With it enabled, alerts are grouped per target host: the first alert
//! opens a pool and starts its timer, later alerts for the same target join
//! it, and the pool is flushed as one batch when the timer expires. A flushed
//! pool is removed from the map, so an alert arriving while that batch runs
//! always opens a fresh pool.

use crate::config::PoolTieBreak;
use crate::models::{Alert, TargetHost};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Alerts handed to one plan request / execution unit
#[derive(Debug, Clone)]
pub struct Batch {
    pub target: TargetHost,
    pub alerts: Vec<Alert>,
    pub pooled: bool,
}

#[derive(Debug)]
struct PendingPool {
    target: TargetHost,
    opened_at: Instant,
    alerts: Vec<Alert>,
}

pub struct PoolingWindow {
    enabled: bool,
    window: Duration,
    tie_break: PoolTieBreak,
    pools: HashMap<String, PendingPool>,
}

impl PoolingWindow {
    pub fn new(enabled: bool, window: Duration, tie_break: PoolTieBreak) -> Self {
        Self {
            enabled,
            window,
            tie_break,
            pools: HashMap::new(),
        }
    }

    /// Number of alerts waiting in open pools
    pub fn pending_alerts(&self) -> usize {
        self.pools.values().map(|p| p.alerts.len()).sum()
    }

    /// Add an accepted alert; returns a batch right away when pooling is off
    pub fn push(&mut self, target: TargetHost, alert: Alert, now: Instant) -> Option<Batch> {
        if !self.enabled {
            return Some(Batch {
                target,
                alerts: vec![alert],
                pooled: false,
            });
        }

        self.pools
            .entry(target.address.clone())
            .or_insert_with(|| PendingPool {
                target,
                opened_at: now,
                alerts: Vec::new(),
            })
            .alerts
            .push(alert);
        None
    }

    /// Remove and return every pool whose timer expired.
    ///
    /// `busy` holds targets with a unit still executing; under
    /// `PoolTieBreak::Defer` their expired pools wait.
    pub fn take_due(&mut self, now: Instant, busy: &HashSet<String>) -> Vec<Batch> {
        let due: Vec<String> = self
            .pools
            .iter()
            .filter(|(address, pool)| {
                now.duration_since(pool.opened_at) >= self.window
                    && !(self.tie_break == PoolTieBreak::Defer && busy.contains(*address))
            })
            .map(|(address, _)| address.clone())
            .collect();

        let mut batches: Vec<(Instant, Batch)> = due
            .into_iter()
            .filter_map(|address| self.pools.remove(&address))
            .map(|pool| {
                (
                    pool.opened_at,
                    Batch {
                        target: pool.target,
                        alerts: pool.alerts,
                        pooled: true,
                    },
                )
            })
            .collect();
        batches.sort_by_key(|(opened_at, _)| *opened_at);
        batches.into_iter().map(|(_, batch)| batch).collect()
    }

    /// Earliest instant at which a pool not held back by `busy` becomes due
    pub fn next_deadline(&self, busy: &HashSet<String>) -> Option<Instant> {
        self.pools
            .iter()
            .filter(|(address, _)| {
                !(self.tie_break == PoolTieBreak::Defer && busy.contains(*address))
            })
            .map(|(_, pool)| pool.opened_at + self.window)
            .min()
    }

    /// Empty every pool regardless of timers (shutdown)
    pub fn drain(&mut self) -> Vec<Batch> {
        self.pools
            .drain()
            .map(|(_, pool)| Batch {
                target: pool.target,
                alerts: pool.alerts,
                pooled: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostRole, ThreatLevel};
    use chrono::Utc;

    fn server() -> TargetHost {
        TargetHost {
            role: HostRole::Server,
            address: "172.31.0.10".into(),
        }
    }

    fn compromised() -> TargetHost {
        TargetHost {
            role: HostRole::Compromised,
            address: "172.30.0.10".into(),
        }
    }

    fn alert(attack: &str) -> Alert {
        Alert {
            source_ip: "172.30.0.10".into(),
            dest_ip: "172.31.0.10".into(),
            attack_id: attack.into(),
            threat_level: ThreatLevel::High,
            description: String::new(),
            timestamp: Utc::now(),
            proto: None,
        }
    }

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn test_disabled_dispatches_immediately() {
        let mut pool = PoolingWindow::new(false, WINDOW, PoolTieBreak::Fresh);
        let batch = pool.push(server(), alert("a"), Instant::now()).unwrap();
        assert_eq!(batch.alerts.len(), 1);
        assert!(!batch.pooled);
        assert_eq!(pool.pending_alerts(), 0);
    }

    #[test]
    fn test_alerts_within_window_form_one_batch() {
        let mut pool = PoolingWindow::new(true, WINDOW, PoolTieBreak::Fresh);
        let t0 = Instant::now();
        let none = HashSet::new();

        assert!(pool.push(server(), alert("a"), t0).is_none());
        assert!(pool.push(server(), alert("b"), t0 + Duration::from_secs(3)).is_none());
        assert!(pool.push(server(), alert("c"), t0 + Duration::from_secs(9)).is_none());
        assert_eq!(pool.next_deadline(&none), Some(t0 + WINDOW));

        assert!(pool.take_due(t0 + Duration::from_secs(9), &none).is_empty());

        let batches = pool.take_due(t0 + WINDOW, &none);
        assert_eq!(batches.len(), 1);
        let ids: Vec<_> = batches[0].alerts.iter().map(|a| a.attack_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(batches[0].pooled);

        // after the flush a new alert starts an independent pool
        assert!(pool.push(server(), alert("d"), t0 + Duration::from_secs(11)).is_none());
        assert!(pool.take_due(t0 + Duration::from_secs(12), &none).is_empty());
        let second = pool.take_due(t0 + Duration::from_secs(21), &none);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].alerts.len(), 1);
    }

    #[test]
    fn test_targets_pool_independently() {
        let mut pool = PoolingWindow::new(true, WINDOW, PoolTieBreak::Fresh);
        let t0 = Instant::now();
        let none = HashSet::new();

        pool.push(server(), alert("a"), t0);
        pool.push(compromised(), alert("b"), t0 + Duration::from_secs(5));

        let first = pool.take_due(t0 + WINDOW, &none);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].target, server());
        assert_eq!(pool.next_deadline(&none), Some(t0 + Duration::from_secs(15)));

        let second = pool.take_due(t0 + Duration::from_secs(15), &none);
        assert_eq!(second[0].target, compromised());
    }

    #[test]
    fn test_fresh_tie_break_flushes_while_target_busy() {
        let mut pool = PoolingWindow::new(true, WINDOW, PoolTieBreak::Fresh);
        let t0 = Instant::now();
        let busy: HashSet<String> = [server().address].into_iter().collect();

        pool.push(server(), alert("a"), t0);
        assert_eq!(pool.take_due(t0 + WINDOW, &busy).len(), 1);
    }

    #[test]
    fn test_defer_tie_break_waits_for_running_unit() {
        let mut pool = PoolingWindow::new(true, WINDOW, PoolTieBreak::Defer);
        let t0 = Instant::now();
        let busy: HashSet<String> = [server().address].into_iter().collect();

        pool.push(server(), alert("a"), t0);
        assert!(pool.take_due(t0 + WINDOW, &busy).is_empty());
        assert_eq!(pool.next_deadline(&busy), None);

        let batches = pool.take_due(t0 + WINDOW, &HashSet::new());
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_drain_empties_all_pools() {
        let mut pool = PoolingWindow::new(true, WINDOW, PoolTieBreak::Fresh);
        let t0 = Instant::now();
        pool.push(server(), alert("a"), t0);
        pool.push(compromised(), alert("b"), t0);

        assert_eq!(pool.drain().len(), 2);
        assert_eq!(pool.pending_alerts(), 0);
    }
}
