//! Timeline and execution logs
//!
//! Two append-only JSON-lines artifacts:
//! - the timeline, one event per line (`ts`, `level`, `msg`, optional `alert`,
//!   `exec` and `data`), also mirrored to tracing so it lands in the
//!   detailed activity log;
//! - the execution log, one `ExecutionRecord` per attempt.
//!
//! Writes go through a single mutex-guarded handle per file so concurrent
//! units never interleave partial lines. A failed write is reported through
//! tracing and otherwise ignored: logging must never take the loop down.

use crate::models::ExecutionRecord;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Init,
    Alert,
    Plan,
    Ssh,
    Exec,
    Done,
    Warn,
    Error,
}

/// Correlation ids attached to a timeline entry
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub alert: Option<String>,
    pub exec: Option<String>,
}

impl EventContext {
    pub fn alert(id: impl Into<String>) -> Self {
        Self {
            alert: Some(id.into()),
            exec: None,
        }
    }

    pub fn exec(id: impl Into<String>) -> Self {
        Self {
            alert: None,
            exec: Some(id.into()),
        }
    }

    pub fn with_exec(mut self, id: impl Into<String>) -> Self {
        self.exec = Some(id.into());
        self
    }

    fn suffix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(alert) = &self.alert {
            parts.push(format!("#{}", short(alert)));
        }
        if let Some(exec) = &self.exec {
            parts.push(format!("@{}", short(exec)));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" {}", parts.join(" "))
        }
    }
}

fn short(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[derive(Serialize)]
struct TimelineEntry<'a> {
    ts: String,
    level: EventLevel,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// Append-only JSON-lines file
struct JsonlWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn append<T: Serialize>(&self, value: &T) {
        let mut line = match serde_json::to_vec(value) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize entry for {}: {}", self.path.display(), e);
                return;
            }
        };
        line.push(b'\n');

        let mut file = self.file.lock();
        let written = file.write_all(&line);
        if let Err(e) = written.and_then(|_| file.flush()) {
            error!("failed to append to {}: {}", self.path.display(), e);
        }
    }
}

/// Structured lifecycle timeline
pub struct Timeline {
    writer: JsonlWriter,
}

impl Timeline {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self {
            writer: JsonlWriter::open(path.as_ref())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    pub fn event(&self, level: EventLevel, msg: &str, ctx: &EventContext, data: Option<Value>) {
        let line = format!("{}{}", msg, ctx.suffix());
        match level {
            EventLevel::Error => error!("{}", line),
            EventLevel::Warn => warn!("{}", line),
            _ => info!("[{:?}] {}", level, line),
        }

        let alert = ctx.alert.as_deref().map(short);
        let exec = ctx.exec.as_deref().map(short);
        self.writer.append(&TimelineEntry {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level,
            msg,
            alert,
            exec,
            data: data.as_ref(),
        });
    }
}

/// One record per execution attempt
pub struct ExecutionLog {
    writer: JsonlWriter,
}

impl ExecutionLog {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self {
            writer: JsonlWriter::open(path.as_ref())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    pub fn append(&self, record: &ExecutionRecord) {
        self.writer.append(record);
    }
}

/// Read back a JSON-lines artifact (used by tests and tooling)
pub fn read_jsonl(path: &Path) -> std::io::Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
