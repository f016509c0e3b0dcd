//! Remote execution seams
//!
//! A `Transport` opens a `Channel` to one host. A channel runs one command at
//! a time; channels that can hold an interactive shell open also hand out a
//! `Session` that runs a sequence of commands through one remote process.

use super::ExecutionError;
use crate::models::{CommandRecord, TargetHost};
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a channel; `ExecutionError::Connection` when the host is unreachable
    async fn connect(&self, target: &TargetHost) -> Result<Box<dyn Channel>, ExecutionError>;
}

#[async_trait]
pub trait Channel: Send {
    /// Run one command to completion. A non-zero exit status is not an error
    /// here; it is reported in the returned record.
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError>;

    fn supports_sessions(&self) -> bool {
        false
    }

    async fn open_session(&mut self) -> Result<Box<dyn Session>, ExecutionError> {
        Err(ExecutionError::SessionUnsupported)
    }

    async fn close(&mut self) {}
}

#[async_trait]
pub trait Session: Send {
    async fn run(&mut self, command: &str) -> Result<CommandRecord, ExecutionError>;

    async fn close(&mut self);
}
