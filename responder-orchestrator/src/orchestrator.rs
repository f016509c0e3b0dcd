//! Orchestration loop
//!
//! Single-threaded intake (poll feed, filter, pool) on a fixed cadence, with
//! one spawned task per execution unit so a slow target never blocks intake.

use crate::config::ResponderConfig;
use crate::execution::channel::Transport;
use crate::execution::{EngineSettings, ExecutionEngine, ExecutionUnit};
use crate::feed::{AlertFeed, FeedItem};
use crate::filter::{AlertFilter, Decision, RejectReason};
use crate::models::{Alert, HostRole, Outcome, PairKey, TargetHost};
use crate::planner::Planner;
use crate::pool::{Batch, PoolingWindow};
use crate::state::{new_state, Shared};
use crate::store::AlertStore;
use crate::timeline::{EventContext, EventLevel, ExecutionLog, Timeline};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maps an alert to the host that should be remediated
#[derive(Debug, Clone)]
pub struct HostRouter {
    server_ip: String,
    compromised_ip: String,
}

impl HostRouter {
    pub fn new(server_ip: impl Into<String>, compromised_ip: impl Into<String>) -> Self {
        Self {
            server_ip: server_ip.into(),
            compromised_ip: compromised_ip.into(),
        }
    }

    pub fn resolve(&self, alert: &Alert) -> TargetHost {
        if alert.dest_ip == self.server_ip {
            return self.server();
        }
        if alert.source_ip == self.compromised_ip {
            return self.compromised();
        }
        for ip in [&alert.dest_ip, &alert.source_ip] {
            if same_subnet(ip, &self.server_ip) {
                return self.server();
            }
            if same_subnet(ip, &self.compromised_ip) {
                return self.compromised();
            }
        }
        warn!(
            "no host role matches {} -> {}, defaulting to server {}",
            alert.source_ip, alert.dest_ip, self.server_ip
        );
        self.server()
    }

    fn server(&self) -> TargetHost {
        TargetHost {
            role: HostRole::Server,
            address: self.server_ip.clone(),
        }
    }

    fn compromised(&self) -> TargetHost {
        TargetHost {
            role: HostRole::Compromised,
            address: self.compromised_ip.clone(),
        }
    }
}

/// Both addresses parse as IPv4 and share their /24
fn same_subnet(a: &str, b: &str) -> bool {
    match (a.parse::<Ipv4Addr>(), b.parse::<Ipv4Addr>()) {
        (Ok(a), Ok(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}

/// Collaborators handed to the orchestrator; all injectable for tests
pub struct Components {
    pub feed: AlertFeed,
    pub store: Arc<dyn AlertStore>,
    pub planner: Arc<dyn Planner>,
    pub transport: Arc<dyn Transport>,
    pub timeline: Arc<Timeline>,
    pub exec_log: Arc<ExecutionLog>,
}

/// What a finished unit task reports back to the loop
#[derive(Debug, Clone)]
pub struct UnitSummary {
    pub unit_id: String,
    pub target: TargetHost,
    pub alerts: usize,
    /// `None` when no plan was obtained
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IntakeStats {
    pub lines: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub malformed: usize,
}

/// Counts in-flight units per target address; decremented on drop
struct BusyGuard {
    busy: Shared<HashMap<String, usize>>,
    address: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock();
        if let Some(n) = busy.get_mut(&self.address) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                busy.remove(&self.address);
            }
        }
    }
}

pub struct Orchestrator {
    poll_interval: Duration,
    duplicate_window: Duration,
    shutdown_grace: Duration,
    feed: AlertFeed,
    filter: AlertFilter,
    pool: PoolingWindow,
    router: HostRouter,
    planner: Arc<dyn Planner>,
    engine: Arc<ExecutionEngine>,
    timeline: Arc<Timeline>,
    units: JoinSet<UnitSummary>,
    busy: Shared<HashMap<String, usize>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: &ResponderConfig, parts: Components, cancel: CancellationToken) -> Self {
        let settings = EngineSettings {
            max_retries: config.max_execution_retries,
            retry_backoff: config.retry_backoff(),
            execution_timeout: config.execution_timeout(),
            session_mode: config.enable_multi_alert,
            multi_alert_delay: config.multi_alert_delay(),
        };
        let engine = ExecutionEngine::new(
            parts.transport,
            settings,
            parts.timeline.clone(),
            parts.exec_log,
        );

        Self {
            poll_interval: config.poll_interval(),
            duplicate_window: config.duplicate_window(),
            shutdown_grace: config.shutdown_grace(),
            feed: parts.feed,
            filter: AlertFilter::new(parts.store, config.duplicate_window()),
            pool: PoolingWindow::new(
                config.enable_multi_alert,
                config.pool_window(),
                config.pool_tie_break,
            ),
            router: HostRouter::new(&config.server_ip, &config.compromised_ip),
            planner: parts.planner,
            engine: Arc::new(engine),
            timeline: parts.timeline,
            units: JoinSet::new(),
            busy: new_state(HashMap::new()),
            cancel,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.units.len()
    }

    /// Run until the cancel token fires, then shut down gracefully
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("orchestration loop started (interval {:?})", self.poll_interval);

        loop {
            let deadline = self.pool.next_deadline(&self.busy_targets());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.intake().await;
                    self.flush_due(Instant::now());
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_due(Instant::now());
                }
                Some(joined) = self.units.join_next(), if !self.units.is_empty() => {
                    self.on_unit_joined(joined);
                    // a deferred pool may be waiting for this target
                    self.flush_due(Instant::now());
                }
            }
        }

        self.shutdown().await;
    }

    /// One intake pass followed by a flush of expired pools
    pub async fn tick(&mut self) -> IntakeStats {
        let stats = self.intake().await;
        self.flush_due(Instant::now());
        stats
    }

    /// Wait for every spawned unit to finish
    pub async fn wait_idle(&mut self) -> Vec<UnitSummary> {
        let mut done = Vec::new();
        while let Some(joined) = self.units.join_next().await {
            if let Some(summary) = self.on_unit_joined(joined) {
                done.push(summary);
            }
        }
        done
    }

    async fn intake(&mut self) -> IntakeStats {
        let mut stats = IntakeStats::default();
        let batch = match self.feed.poll().await {
            Ok(batch) => batch,
            Err(e) => {
                error!("failed to read alert feed: {}", e);
                return stats;
            }
        };

        if batch.rotated {
            self.timeline.event(
                EventLevel::Warn,
                &format!("Alert feed {} rotated or truncated, reading from start", self.feed.path().display()),
                &EventContext::default(),
                None,
            );
        }

        let now = Utc::now();
        let instant = Instant::now();
        for item in batch {
            stats.lines += 1;
            match item {
                FeedItem::Alert(alert) => {
                    if self.admit(alert, now, instant) {
                        stats.accepted += 1;
                    } else {
                        stats.rejected += 1;
                    }
                }
                FeedItem::Control(note) => debug!("feed control record: {}", note),
                FeedItem::Malformed { line, error } => {
                    stats.malformed += 1;
                    let excerpt: String = line.chars().take(200).collect();
                    self.timeline.event(
                        EventLevel::Error,
                        &format!("Failed to parse alert line: {}", error),
                        &EventContext::default(),
                        Some(json!({ "line": excerpt })),
                    );
                }
            }
        }

        let store = self.filter.store();
        let pruned = store.prune(now, self.duplicate_window);
        // dedup state first: a crash before the cursor commit only replays
        // lines the store already rejects
        if stats.accepted > 0 || pruned > 0 {
            if let Err(e) = store.persist() {
                error!("failed to persist dedup state: {}", e);
            }
        }
        if let Err(e) = self.feed.commit().await {
            error!("failed to commit feed cursor: {}", e);
        }

        if stats.lines > 0 {
            debug!(
                "intake: {} lines, {} accepted, {} rejected, {} malformed",
                stats.lines, stats.accepted, stats.rejected, stats.malformed
            );
        }
        stats
    }

    fn admit(&mut self, alert: Alert, now: chrono::DateTime<Utc>, instant: Instant) -> bool {
        let key = alert.dedup_key();
        match self.filter.evaluate(&alert, now) {
            Decision::Reject(RejectReason::Severity(level)) => {
                debug!("ignoring {} alert {}", level, key);
                false
            }
            Decision::Reject(reason @ RejectReason::Duplicate { .. }) => {
                info!("skipping {}: {}", key, reason);
                false
            }
            Decision::Accept => {
                let target = self.router.resolve(&alert);
                self.timeline.event(
                    EventLevel::Alert,
                    &format!(
                        "New: {} {} -> {} ({}), target {} {}",
                        alert.attack_id,
                        alert.source_ip,
                        alert.dest_ip,
                        alert.threat_level,
                        target.role,
                        target.address
                    ),
                    &EventContext::alert(key.short_id()),
                    serde_json::to_value(&alert).ok(),
                );

                match self.pool.push(target, alert, instant) {
                    Some(batch) => self.dispatch(batch),
                    None => debug!("pooled {} ({} alerts waiting)", key, self.pool.pending_alerts()),
                }
                true
            }
        }
    }

    fn flush_due(&mut self, now: Instant) {
        let busy = self.busy_targets();
        for batch in self.pool.take_due(now, &busy) {
            info!(
                "flushing pool for {} with {} alert(s)",
                batch.target.address,
                batch.alerts.len()
            );
            self.dispatch(batch);
        }
    }

    fn busy_targets(&self) -> HashSet<String> {
        self.busy.lock().keys().cloned().collect()
    }

    fn dispatch(&mut self, batch: Batch) {
        let pairs: BTreeSet<PairKey> = batch.alerts.iter().map(Alert::pair).collect();
        let unit = ExecutionUnit {
            unit_id: uuid::Uuid::new_v4().to_string(),
            target: batch.target.clone(),
            pairs: pairs.into_iter().collect(),
            alert_ids: batch.alerts.iter().map(|a| a.dedup_key().short_id()).collect(),
        };

        debug!(
            "dispatching unit {} for {} ({} alert(s), {})",
            unit.unit_id,
            unit.target.address,
            batch.alerts.len(),
            if batch.pooled { "pooled" } else { "immediate" }
        );

        *self.busy.lock().entry(unit.target.address.clone()).or_insert(0) += 1;
        let guard = BusyGuard {
            busy: self.busy.clone(),
            address: unit.target.address.clone(),
        };

        let alerts = batch.alerts;
        let planner = self.planner.clone();
        let engine = self.engine.clone();
        let timeline = self.timeline.clone();
        let cancel = self.cancel.clone();
        self.units.spawn(async move {
            let _guard = guard;
            run_unit(unit, alerts, planner, engine, timeline, cancel).await
        });
    }

    fn on_unit_joined(&mut self, joined: Result<UnitSummary, tokio::task::JoinError>) -> Option<UnitSummary> {
        match joined {
            Ok(summary) => {
                debug!(
                    "unit {} for {} ({} alert(s)) joined: {:?}",
                    summary.unit_id, summary.target.address, summary.alerts, summary.outcome
                );
                Some(summary)
            }
            Err(e) => {
                error!("execution unit task failed: {}", e);
                None
            }
        }
    }

    async fn shutdown(mut self) {
        info!("shutting down, {} unit(s) in flight", self.units.len());
        self.cancel.cancel();

        for batch in self.pool.drain() {
            self.timeline.event(
                EventLevel::Error,
                &format!(
                    "Discarding {} pooled alert(s) for {} at shutdown",
                    batch.alerts.len(),
                    batch.target.address
                ),
                &EventContext::default(),
                Some(json!({
                    "alerts": batch.alerts.iter().map(|a| a.dedup_key().short_id()).collect::<Vec<_>>(),
                })),
            );
        }

        let grace = self.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.units.join_next().await {
                self.on_unit_joined(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} unit(s) still running after {:?}, aborting", self.units.len(), grace);
            self.units.abort_all();
        }

        if let Err(e) = self.filter.store().persist() {
            error!("failed to persist dedup state at shutdown: {}", e);
        }
        if let Err(e) = self.feed.commit().await {
            error!("failed to commit feed cursor at shutdown: {}", e);
        }
        info!("orchestrator stopped");
    }
}

async fn run_unit(
    unit: ExecutionUnit,
    alerts: Vec<Alert>,
    planner: Arc<dyn Planner>,
    engine: Arc<ExecutionEngine>,
    timeline: Arc<Timeline>,
    cancel: CancellationToken,
) -> UnitSummary {
    let ctx = unit.context();
    let mut summary = UnitSummary {
        unit_id: unit.unit_id.clone(),
        target: unit.target.clone(),
        alerts: alerts.len(),
        outcome: None,
    };

    info!(
        "requesting plan for {} {} covering {} alert(s)",
        unit.target.role,
        unit.target.address,
        alerts.len()
    );
    let plan_started = Instant::now();
    let requested = tokio::select! {
        res = planner.request_plan(&unit.target, &alerts) => res,
        _ = cancel.cancelled() => {
            timeline.event(
                EventLevel::Error,
                &format!("Plan request for {} cancelled by shutdown", unit.target.address),
                &ctx,
                None,
            );
            return summary;
        }
    };
    let plan_secs = plan_started.elapsed().as_secs_f64();

    let plan = match requested {
        Ok(plan) => plan,
        Err(e) => {
            timeline.event(
                EventLevel::Error,
                &format!("Planning failed for {}: {}", unit.target.address, e),
                &ctx,
                Some(json!({
                    "target_ip": unit.target.address,
                    "alerts": unit.alert_ids,
                    "duration_secs": plan_secs,
                })),
            );
            return summary;
        }
    };

    timeline.event(
        EventLevel::Plan,
        &format!(
            "Plan {} received for {} with {} action(s) in {:.1}s",
            plan.plan_id,
            plan.target_ip,
            plan.actions.len(),
            plan_secs
        ),
        &ctx,
        Some(json!({
            "plan_id": plan.plan_id,
            "actions": plan.actions,
            "model": plan.model,
            "duration_secs": plan_secs,
        })),
    );

    let exec_started = Instant::now();
    let record = engine.execute(&unit, &plan, &cancel).await;
    let exec_secs = exec_started.elapsed().as_secs_f64();

    timeline.event(
        EventLevel::Done,
        &format!(
            "Unit finished on {} with {:?} after {} attempt(s), total {:.1}s",
            unit.target.address,
            record.outcome,
            record.attempt_number,
            plan_secs + exec_secs
        ),
        &ctx,
        Some(json!({
            "plan_id": plan.plan_id,
            "outcome": record.outcome,
            "attempts": record.attempt_number,
            "alerts": unit.alert_ids,
            "plan_secs": plan_secs,
            "exec_secs": exec_secs,
        })),
    );

    summary.outcome = Some(record.outcome);
    summary
}
