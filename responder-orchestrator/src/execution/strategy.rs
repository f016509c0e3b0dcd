//! Execution strategies
//!
//! `PerCommand` issues every action as its own invocation; `SessionMode`
//! drives all actions through one long-lived remote shell, spaced by the
//! multi-alert delay. Both fail fast: the first non-zero exit status stops
//! the plan. Results are pushed into the caller's vector as they complete so
//! a timed-out or cancelled run still leaves its finished commands behind.

use super::channel::Channel;
use super::ExecutionError;
use crate::models::CommandRecord;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Name written to execution records
    fn mode(&self) -> &'static str;

    async fn run(
        &self,
        channel: &mut dyn Channel,
        actions: &[String],
        results: &mut Vec<CommandRecord>,
    ) -> Result<(), ExecutionError>;
}

pub struct PerCommand;

#[async_trait]
impl ExecutionStrategy for PerCommand {
    fn mode(&self) -> &'static str {
        "per_command"
    }

    async fn run(
        &self,
        channel: &mut dyn Channel,
        actions: &[String],
        results: &mut Vec<CommandRecord>,
    ) -> Result<(), ExecutionError> {
        for action in actions {
            debug!("running `{}`", action);
            let record = channel.run(action).await?;
            let status = record.exit_status;
            results.push(record);
            check_status(action, status)?;
        }
        Ok(())
    }
}

pub struct SessionMode {
    pub delay: Duration,
}

#[async_trait]
impl ExecutionStrategy for SessionMode {
    fn mode(&self) -> &'static str {
        "session"
    }

    async fn run(
        &self,
        channel: &mut dyn Channel,
        actions: &[String],
        results: &mut Vec<CommandRecord>,
    ) -> Result<(), ExecutionError> {
        let mut session = channel.open_session().await?;
        let outcome = run_in_session(session.as_mut(), actions, results, self.delay).await;
        session.close().await;
        outcome
    }
}

async fn run_in_session(
    session: &mut dyn super::channel::Session,
    actions: &[String],
    results: &mut Vec<CommandRecord>,
    delay: Duration,
) -> Result<(), ExecutionError> {
    for (idx, action) in actions.iter().enumerate() {
        if idx > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!("session step {}/{}: `{}`", idx + 1, actions.len(), action);
        let record = session.run(action).await?;
        let status = record.exit_status;
        results.push(record);
        check_status(action, status)?;
    }
    Ok(())
}

fn check_status(command: &str, status: i32) -> Result<(), ExecutionError> {
    if status == 0 {
        Ok(())
    } else {
        Err(ExecutionError::CommandFailure {
            command: command.to_string(),
            status,
        })
    }
}
