//! Execution engine
//!
//! Drives one execution unit (a single alert or a pooled batch) through
//!
//! ```text
//! PENDING -> CONNECTING -> RUNNING -> SUCCEEDED
//!               ^            |
//!               |            v
//!               +-------- FAILED (retries left)
//! ```
//!
//! Connection failures, non-zero exits and the RUNNING time budget all land
//! in FAILED. Attempt `n` that fails with retries left is followed by a
//! linear backoff of `n * EXECUTION_RETRY_BACKOFF`; the last allowed attempt
//! ends the unit as EXHAUSTED_RETRIES. Each attempt appends exactly one
//! execution record.

pub mod channel;
pub mod locks;
pub mod ssh;
pub mod strategy;

#[cfg(test)]
pub(crate) mod scripted;

use crate::models::{CommandRecord, ExecutionRecord, Outcome, PairKey, Plan, TargetHost};
use crate::timeline::{EventContext, EventLevel, ExecutionLog, Timeline};
use channel::{Channel, Transport};
use chrono::{DateTime, Utc};
use locks::{PairGuard, PairLocks};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strategy::{ExecutionStrategy, PerCommand, SessionMode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },
    #[error("command `{command}` exited with status {status}")]
    CommandFailure { command: String, status: i32 },
    #[error("execution exceeded {}s budget", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
    #[error("channel does not support interactive sessions")]
    SessionUnsupported,
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a unit is in its lifecycle; `execute` advances it one step per turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Waiting for the unit's pair locks
    Pending,
    Connecting { attempt: u32 },
    Running { attempt: u32 },
    /// Attempt failed with retries left; backing off before the next one
    Failed { attempt: u32 },
}

/// Bookkeeping for the attempt in progress, turned into its record when it settles
struct Attempt {
    number: u32,
    started_at: DateTime<Utc>,
    mode: &'static str,
    results: Vec<CommandRecord>,
}

impl Attempt {
    fn start(number: u32) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            mode: PerCommand.mode(),
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub execution_timeout: Duration,
    /// Use one interactive session per unit when the channel can hold one
    pub session_mode: bool,
    pub multi_alert_delay: Duration,
}

/// Scope over which one plan runs and retries as a whole
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub unit_id: String,
    pub target: TargetHost,
    pub pairs: Vec<PairKey>,
    pub alert_ids: Vec<String>,
}

impl ExecutionUnit {
    pub fn context(&self) -> EventContext {
        let ctx = EventContext::exec(&self.unit_id);
        match self.alert_ids.as_slice() {
            [single] => EventContext {
                alert: Some(single.clone()),
                ..ctx
            },
            _ => ctx,
        }
    }
}

pub struct ExecutionEngine {
    transport: Arc<dyn Transport>,
    locks: PairLocks,
    settings: EngineSettings,
    timeline: Arc<Timeline>,
    exec_log: Arc<ExecutionLog>,
}

impl ExecutionEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: EngineSettings,
        timeline: Arc<Timeline>,
        exec_log: Arc<ExecutionLog>,
    ) -> Self {
        Self {
            transport,
            locks: PairLocks::new(),
            settings,
            timeline,
            exec_log,
        }
    }

    /// Run `plan` for `unit` until a terminal outcome; returns the final record
    pub async fn execute(
        &self,
        unit: &ExecutionUnit,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let ctx = unit.context();
        let max_attempts = self.settings.max_retries + 1;

        let mut state = UnitState::Pending;
        let mut _locks: Option<PairGuard> = None;
        let mut channel: Option<Box<dyn Channel>> = None;
        let mut current = Attempt::start(1);

        loop {
            debug!("unit {} {:?}", unit.unit_id, state);
            state = match state {
                UnitState::Pending => {
                    let waited_from = Utc::now();
                    tokio::select! {
                        guard = self.locks.acquire(unit.pairs.iter().cloned()) => {
                            debug!("unit {} holds {} pair lock(s)", unit.unit_id, guard.pairs().len());
                            _locks = Some(guard);
                            UnitState::Connecting { attempt: 1 }
                        }
                        _ = cancel.cancelled() => {
                            return self.finish_cancelled(unit, plan, 1, waited_from, "cancelled while waiting for pair lock", &ctx);
                        }
                    }
                }

                UnitState::Connecting { attempt } => {
                    self.timeline.event(
                        EventLevel::Ssh,
                        &format!(
                            "Connecting to {} {} (attempt {}/{})",
                            unit.target.role, unit.target.address, attempt, max_attempts
                        ),
                        &ctx,
                        Some(json!({"attempt": attempt, "target_ip": unit.target.address})),
                    );
                    current = Attempt::start(attempt);

                    let connected = tokio::select! {
                        res = self.transport.connect(&unit.target) => res,
                        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
                    };
                    match connected {
                        Ok(opened) => {
                            channel = Some(opened);
                            UnitState::Running { attempt }
                        }
                        Err(e) => {
                            let record = self.settle(unit, plan, &mut current, Err(e), max_attempts, &ctx);
                            if record.outcome.is_terminal() {
                                return record;
                            }
                            UnitState::Failed { attempt }
                        }
                    }
                }

                UnitState::Running { attempt } => {
                    let run = match channel.take() {
                        Some(mut ch) => {
                            let session;
                            let strategy: &dyn ExecutionStrategy =
                                if self.settings.session_mode && ch.supports_sessions() {
                                    session = SessionMode {
                                        delay: self.settings.multi_alert_delay,
                                    };
                                    &session
                                } else {
                                    &PerCommand
                                };
                            current.mode = strategy.mode();
                            debug!("unit {} running {} action(s) ({})", unit.unit_id, plan.actions.len(), current.mode);

                            let budget = self.settings.execution_timeout;
                            let res = tokio::select! {
                                res = tokio::time::timeout(budget, strategy.run(ch.as_mut(), &plan.actions, &mut current.results)) => {
                                    res.unwrap_or(Err(ExecutionError::Timeout(budget)))
                                }
                                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
                            };
                            ch.close().await;
                            res
                        }
                        None => Err(ExecutionError::Connection {
                            host: unit.target.address.clone(),
                            reason: "no open channel".into(),
                        }),
                    };

                    let record = self.settle(unit, plan, &mut current, run, max_attempts, &ctx);
                    if record.outcome.is_terminal() {
                        return record;
                    }
                    UnitState::Failed { attempt }
                }

                UnitState::Failed { attempt } => {
                    let backoff = self.settings.retry_backoff.mul_f64(f64::from(attempt));
                    let backoff_from = Utc::now();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => UnitState::Connecting { attempt: attempt + 1 },
                        _ = cancel.cancelled() => {
                            return self.finish_cancelled(unit, plan, attempt + 1, backoff_from, "cancelled during retry backoff", &ctx);
                        }
                    }
                }
            };
        }
    }

    /// Close out one attempt: append its record and report it on the timeline
    fn settle(
        &self,
        unit: &ExecutionUnit,
        plan: &Plan,
        attempt: &mut Attempt,
        run: Result<(), ExecutionError>,
        max_attempts: u32,
        ctx: &EventContext,
    ) -> ExecutionRecord {
        let outcome = match &run {
            Ok(()) => Outcome::Succeeded,
            Err(ExecutionError::Cancelled) => Outcome::Cancelled,
            Err(_) if attempt.number < max_attempts => Outcome::Failed,
            Err(_) => Outcome::ExhaustedRetries,
        };

        let record = ExecutionRecord {
            unit_id: unit.unit_id.clone(),
            plan_id: plan.plan_id.clone(),
            target_ip: unit.target.address.clone(),
            target_role: unit.target.role,
            mode: attempt.mode.to_string(),
            attempt_number: attempt.number,
            started_at: attempt.started_at,
            finished_at: Utc::now(),
            per_command: std::mem::take(&mut attempt.results),
            outcome,
            error: run.err().map(|e| e.to_string()),
        };
        self.exec_log.append(&record);
        self.report_attempt(&record, max_attempts, ctx);
        if outcome.is_terminal() {
            debug!("unit {} finished: {:?}", unit.unit_id, outcome);
        }
        record
    }

    fn report_attempt(&self, record: &ExecutionRecord, max_attempts: u32, ctx: &EventContext) {
        let commands: Vec<_> = record
            .per_command
            .iter()
            .map(|c| {
                json!({
                    "command": c.command,
                    "exit_status": c.exit_status,
                    "stdout": c.stdout,
                    "stderr": c.stderr,
                })
            })
            .collect();
        let data = json!({
            "attempt": record.attempt_number,
            "mode": record.mode,
            "plan_id": record.plan_id,
            "outcome": record.outcome,
            "commands": commands,
            "error": record.error,
        });

        match record.outcome {
            Outcome::Succeeded => self.timeline.event(
                EventLevel::Exec,
                &format!(
                    "Executed {} command(s) on {} (attempt {})",
                    record.per_command.len(),
                    record.target_ip,
                    record.attempt_number
                ),
                ctx,
                Some(data),
            ),
            Outcome::Failed => self.timeline.event(
                EventLevel::Error,
                &format!(
                    "Attempt {}/{} on {} failed: {}",
                    record.attempt_number,
                    max_attempts,
                    record.target_ip,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
                ctx,
                Some(data),
            ),
            Outcome::ExhaustedRetries => self.timeline.event(
                EventLevel::Error,
                &format!(
                    "EXHAUSTED RETRIES on {} after {} attempt(s): {}",
                    record.target_ip,
                    record.attempt_number,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
                ctx,
                Some(data),
            ),
            Outcome::Cancelled => self.timeline.event(
                EventLevel::Error,
                &format!(
                    "Execution on {} cancelled after {} command(s)",
                    record.target_ip,
                    record.per_command.len()
                ),
                ctx,
                Some(data),
            ),
        }
    }

    fn finish_cancelled(
        &self,
        unit: &ExecutionUnit,
        plan: &Plan,
        attempt: u32,
        started_at: DateTime<Utc>,
        reason: &str,
        ctx: &EventContext,
    ) -> ExecutionRecord {
        let record = ExecutionRecord {
            unit_id: unit.unit_id.clone(),
            plan_id: plan.plan_id.clone(),
            target_ip: unit.target.address.clone(),
            target_role: unit.target.role,
            mode: PerCommand.mode().to_string(),
            attempt_number: attempt,
            started_at,
            finished_at: Utc::now(),
            per_command: Vec::new(),
            outcome: Outcome::Cancelled,
            error: Some(reason.to_string()),
        };
        self.exec_log.append(&record);
        self.report_attempt(&record, self.settings.max_retries + 1, ctx);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostRole;
    use crate::timeline::read_jsonl;
    use scripted::ScriptedTransport;

    struct Fixture {
        _dir: tempfile::TempDir,
        timeline: Arc<Timeline>,
        exec_log: Arc<ExecutionLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let timeline = Arc::new(Timeline::open(dir.path().join("timeline.jsonl")).unwrap());
        let exec_log = Arc::new(ExecutionLog::open(dir.path().join("exec.jsonl")).unwrap());
        Fixture {
            _dir: dir,
            timeline,
            exec_log,
        }
    }

    fn settings(max_retries: u32) -> EngineSettings {
        EngineSettings {
            max_retries,
            retry_backoff: Duration::from_millis(10),
            execution_timeout: Duration::from_secs(5),
            session_mode: false,
            multi_alert_delay: Duration::ZERO,
        }
    }

    fn engine(transport: &ScriptedTransport, settings: EngineSettings, fx: &Fixture) -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(transport.clone()),
            settings,
            fx.timeline.clone(),
            fx.exec_log.clone(),
        )
    }

    fn unit(id: &str) -> ExecutionUnit {
        ExecutionUnit {
            unit_id: id.into(),
            target: TargetHost {
                role: HostRole::Server,
                address: "172.31.0.10".into(),
            },
            pairs: vec![PairKey {
                source_ip: "172.30.0.10".into(),
                dest_ip: "172.31.0.10".into(),
            }],
            alert_ids: vec!["a1b2c3d4".into()],
        }
    }

    fn plan(actions: &[&str]) -> Plan {
        Plan {
            plan_id: "plan-1".into(),
            target_ip: "172.31.0.10".into(),
            actions: actions.iter().map(|s| s.to_string()).collect(),
            model: None,
        }
    }

    fn levels(fx: &Fixture) -> Vec<String> {
        read_jsonl(fx.timeline.path())
            .unwrap()
            .iter()
            .map(|e| e["level"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_single_attempt() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        let engine = engine(&transport, settings(3), &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["iptables -A INPUT -s 172.30.0.10 -j DROP"]), &CancellationToken::new())
            .await;

        assert_eq!(record.outcome, Outcome::Succeeded);
        assert_eq!(record.attempt_number, 1);
        assert_eq!(record.mode, "per_command");
        assert_eq!(record.per_command.len(), 1);
        assert_eq!(transport.connects(), 1);

        let records = read_jsonl(fx.exec_log.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["outcome"], "SUCCEEDED");
        assert_eq!(levels(&fx), ["SSH", "EXEC"]);
    }

    #[tokio::test]
    async fn test_connect_failures_stop_at_retry_bound() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.always_fail_connect();
        let engine = engine(&transport, settings(3), &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["true"]), &CancellationToken::new())
            .await;

        assert_eq!(transport.connects(), 4);
        assert_eq!(record.outcome, Outcome::ExhaustedRetries);
        assert_eq!(record.attempt_number, 4);

        let outcomes: Vec<_> = read_jsonl(fx.exec_log.path())
            .unwrap()
            .iter()
            .map(|r| r["outcome"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(outcomes, ["FAILED", "FAILED", "FAILED", "EXHAUSTED_RETRIES"]);
        assert!(!levels(&fx).contains(&"EXEC".to_string()));
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.always_fail_connect();
        let engine = engine(&transport, settings(0), &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["true"]), &CancellationToken::new())
            .await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(record.outcome, Outcome::ExhaustedRetries);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_connect_failure() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.fail_connects(2);
        let engine = engine(&transport, settings(3), &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["true"]), &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, Outcome::Succeeded);
        assert_eq!(record.attempt_number, 3);
        assert_eq!(read_jsonl(fx.exec_log.path()).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_command_failure_retries_whole_unit_from_the_top() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.set_exit_code("step2", 1);
        let engine = engine(&transport, settings(1), &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["step1", "step2", "step3"]), &CancellationToken::new())
            .await;

        assert_eq!(record.outcome, Outcome::ExhaustedRetries);
        assert_eq!(transport.commands(), ["step1", "step2", "step1", "step2"]);
        assert_eq!(record.per_command.len(), 2);
        assert!(record.error.as_deref().unwrap().contains("step2"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.set_command_delay(Duration::from_millis(300));
        let mut s = settings(1);
        s.execution_timeout = Duration::from_millis(450);
        let engine = engine(&transport, s, &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["a", "b", "c"]), &CancellationToken::new())
            .await;

        assert_eq!(record.outcome, Outcome::ExhaustedRetries);
        assert_eq!(record.attempt_number, 2);
        // the first command finished inside the budget and is kept
        assert_eq!(record.per_command.len(), 1);
        assert!(record.error.as_deref().unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn test_session_mode_when_channel_supports_it() {
        let fx = fixture();
        let transport = ScriptedTransport::new().with_sessions();
        let mut s = settings(0);
        s.session_mode = true;
        let engine = engine(&transport, s, &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["a", "b"]), &CancellationToken::new())
            .await;
        assert_eq!(record.mode, "session");
        assert_eq!(transport.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_session_mode_falls_back_without_capability() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        let mut s = settings(0);
        s.session_mode = true;
        let engine = engine(&transport, s, &fx);

        let record = engine
            .execute(&unit("u1"), &plan(&["a", "b"]), &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, Outcome::Succeeded);
        assert_eq!(record.mode, "per_command");
    }

    #[tokio::test]
    async fn test_same_pair_units_never_run_concurrently() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.set_command_delay(Duration::from_millis(50));
        let engine = Arc::new(engine(&transport, settings(0), &fx));
        let cancel = CancellationToken::new();

        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let engine = engine.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    engine
                        .execute(&unit(&format!("u{i}")), &plan(&["a", "b"]), &cancel)
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap().outcome, Outcome::Succeeded);
        }
        assert_eq!(transport.max_open_channels(), 1);
        assert_eq!(transport.commands().len(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_commands() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.set_command_delay(Duration::from_millis(100));
        let engine = engine(&transport, settings(3), &fx);
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                cancel.cancel();
            })
        };

        let record = engine
            .execute(&unit("u1"), &plan(&["a", "b", "c", "d", "e"]), &cancel)
            .await;
        trigger.await.unwrap();

        assert_eq!(record.outcome, Outcome::Cancelled);
        assert_eq!(record.per_command.len(), 2);
        assert_eq!(transport.connects(), 1);
        assert_eq!(read_jsonl(fx.exec_log.path()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_records_next_attempt() {
        let fx = fixture();
        let transport = ScriptedTransport::new();
        transport.always_fail_connect();
        let mut slow = settings(3);
        slow.retry_backoff = Duration::from_secs(5);
        let engine = engine(&transport, slow, &fx);
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            })
        };

        let record = engine.execute(&unit("u1"), &plan(&["true"]), &cancel).await;
        trigger.await.unwrap();

        assert_eq!(transport.connects(), 1);
        assert_eq!(record.outcome, Outcome::Cancelled);
        assert_eq!(record.attempt_number, 2);
        let outcomes: Vec<_> = read_jsonl(fx.exec_log.path())
            .unwrap()
            .iter()
            .map(|r| r["outcome"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(outcomes, ["FAILED", "CANCELLED"]);
    }
}
