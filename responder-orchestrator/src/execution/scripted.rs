//! Scripted transport for tests
//!
//! Connect failures, exit codes and per-command delays are configured up
//! front; every connect and command is recorded, and the number of channels
//! open at once is tracked per target.

use super::channel::{Channel, Session, Transport};
use super::ExecutionError;
use crate::models::{CommandRecord, TargetHost};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    failing_connects: Option<u32>,
    always_fail: bool,
    exit_codes: HashMap<String, i32>,
    command_delay: Duration,
    connects: u32,
    commands: Vec<String>,
    sessions_opened: u32,
    open_channels: HashMap<String, usize>,
    max_open_channels: usize,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    sessions: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(mut self) -> Self {
        self.sessions = true;
        self
    }

    /// Fail the next `n` connects, then succeed
    pub fn fail_connects(&self, n: u32) {
        self.script.lock().failing_connects = Some(n);
    }

    pub fn always_fail_connect(&self) {
        self.script.lock().always_fail = true;
    }

    pub fn set_exit_code(&self, command: &str, code: i32) {
        self.script.lock().exit_codes.insert(command.to_string(), code);
    }

    pub fn set_command_delay(&self, delay: Duration) {
        self.script.lock().command_delay = delay;
    }

    pub fn connects(&self) -> u32 {
        self.script.lock().connects
    }

    pub fn commands(&self) -> Vec<String> {
        self.script.lock().commands.clone()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.script.lock().sessions_opened
    }

    /// Highest number of channels simultaneously open to one target
    pub fn max_open_channels(&self) -> usize {
        self.script.lock().max_open_channels
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, target: &TargetHost) -> Result<Box<dyn Channel>, ExecutionError> {
        let mut script = self.script.lock();
        script.connects += 1;

        let fail = script.always_fail
            || match script.failing_connects.as_mut() {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
        if fail {
            return Err(ExecutionError::Connection {
                host: target.address.clone(),
                reason: "connection refused".into(),
            });
        }

        let open = script.open_channels.entry(target.address.clone()).or_insert(0);
        *open += 1;
        let open = *open;
        script.max_open_channels = script.max_open_channels.max(open);

        Ok(Box::new(ScriptedChannel {
            script: self.script.clone(),
            host: target.address.clone(),
            sessions: self.sessions,
        }))
    }
}

struct ScriptedChannel {
    script: Arc<Mutex<Script>>,
    host: String,
    sessions: bool,
}

async fn run_scripted(script: &Arc<Mutex<Script>>, command: &str) -> CommandRecord {
    let (delay, code) = {
        let mut s = script.lock();
        s.commands.push(command.to_string());
        (s.command_delay, s.exit_codes.get(command).copied().unwrap_or(0))
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    CommandRecord {
        command: command.to_string(),
        exit_status: code,
        stdout: format!("ran {}", command),
        stderr: String::new(),
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError> {
        Ok(run_scripted(&self.script, command).await)
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    async fn open_session(&mut self) -> Result<Box<dyn Session>, ExecutionError> {
        if !self.sessions {
            return Err(ExecutionError::SessionUnsupported);
        }
        self.script.lock().sessions_opened += 1;
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
        }))
    }
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        if let Some(open) = self.script.lock().open_channels.get_mut(&self.host) {
            *open = open.saturating_sub(1);
        }
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError> {
        Ok(run_scripted(&self.script, command).await)
    }

    async fn close(&mut self) {}
}
