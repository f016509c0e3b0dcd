//! SSH transport over the system `ssh` client
//!
//! Every invocation is a `tokio::process::Command` with `kill_on_drop`, so
//! dropping a future (timeout, shutdown) also kills the remote command.

use super::channel::{Channel, Session, Transport};
use super::ExecutionError;
use crate::config::SshConfig;
use crate::models::{CommandRecord, TargetHost};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// ssh reserves this exit status for its own failures
const SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn base_args(&self, host: &str) -> Vec<String> {
        let cfg = &self.config;
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", cfg.known_hosts.display()),
            "-o".into(),
            format!("ConnectTimeout={}", cfg.connect_timeout_secs),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-i".into(),
            cfg.key_path.display().to_string(),
            "-p".into(),
            cfg.port.to_string(),
            format!("{}@{}", cfg.user, host),
        ]
    }

    fn command(&self, host: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(host))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, target: &TargetHost) -> Result<Box<dyn Channel>, ExecutionError> {
        let host = target.address.clone();
        debug!("probing ssh connectivity to {}", host);

        let output = self
            .command(&host)
            .arg("true")
            .output()
            .await
            .map_err(|e| ExecutionError::Connection {
                host: host.clone(),
                reason: format!("failed to spawn ssh: {}", e),
            })?;

        match output.status.code() {
            Some(0) => Ok(Box::new(SshChannel {
                transport: self.clone(),
                host,
            })),
            code => Err(ExecutionError::Connection {
                reason: format!(
                    "ssh connectivity check exited with {}: {}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                host,
            }),
        }
    }
}

pub struct SshChannel {
    transport: SshTransport,
    host: String,
}

#[async_trait]
impl Channel for SshChannel {
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError> {
        let output = self
            .transport
            .command(&self.host)
            .arg("bash")
            .arg("-c")
            .arg(shell_words::quote(command).into_owned())
            .output()
            .await?;

        let exit_status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_status == SSH_FAILURE {
            return Err(ExecutionError::Connection {
                host: self.host.clone(),
                reason: format!("ssh lost the connection: {}", stderr.trim()),
            });
        }

        Ok(CommandRecord {
            command: command.to_string(),
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    async fn open_session(&mut self) -> Result<Box<dyn Session>, ExecutionError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-T")
            .args(self.transport.base_args(&self.host))
            .arg("bash")
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| session_closed(&self.host))?;
        let stdout = child.stdout.take().ok_or_else(|| session_closed(&self.host))?;

        let mut session = SshSession {
            host: self.host.clone(),
            marker: format!("__RESPONDER_END_{}__", uuid::Uuid::new_v4().simple()),
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
        };
        session.write("exec 2>&1\n").await?;
        Ok(Box::new(session))
    }
}

/// One `bash -s` process on the remote host; each command is framed by a
/// marker line carrying its exit status.
pub struct SshSession {
    host: String,
    marker: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

impl SshSession {
    async fn write(&mut self, text: &str) -> Result<(), ExecutionError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| session_closed(&self.host))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError> {
        let script = framed(command, &self.marker);
        self.write(&script).await?;

        let mut output: Vec<String> = Vec::new();
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(session_closed(&self.host));
            };
            if let Some(status) = parse_marker(&line, &self.marker) {
                // the framing printf starts with a newline of its own
                if output.last().is_some_and(|l| l.is_empty()) {
                    output.pop();
                }
                return Ok(CommandRecord {
                    command: command.to_string(),
                    exit_status: status,
                    stdout: output.join("\n"),
                    stderr: String::new(),
                });
            }
            output.push(line);
        }
    }

    async fn close(&mut self) {
        // closing stdin ends `bash -s`
        self.stdin.take();
        if let Err(e) = self.child.wait().await {
            warn!("ssh session to {} did not exit cleanly: {}", self.host, e);
        }
    }
}

/// Each action runs in its own subshell so an `exit` inside it ends only that action
fn framed(command: &str, marker: &str) -> String {
    format!(
        "( {}\n) < /dev/null\nprintf '\\n{}:%s\\n' \"$?\"\n",
        command, marker
    )
}

fn parse_marker(line: &str, marker: &str) -> Option<i32> {
    line.strip_prefix(marker)?
        .strip_prefix(':')?
        .trim()
        .parse()
        .ok()
}

fn session_closed(host: &str) -> ExecutionError {
    ExecutionError::Connection {
        host: host.to_string(),
        reason: "ssh session closed unexpectedly".into(),
    }
}
