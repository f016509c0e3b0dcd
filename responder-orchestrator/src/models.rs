//! Data model shared by every stage of the responder
//!
//! Alerts are immutable once decoded; plans are consumed exactly once by the
//! execution engine; execution records are written once per attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Severity reported by the detection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

impl ThreatLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => ThreatLevel::Info,
            "low" => ThreatLevel::Low,
            "medium" => ThreatLevel::Medium,
            "high" => ThreatLevel::High,
            "critical" => ThreatLevel::Critical,
            _ => ThreatLevel::Unknown,
        }
    }

    /// Only high and critical alerts are worth a remediation run
    pub fn is_actionable(self) -> bool {
        matches!(self, ThreatLevel::High | ThreatLevel::Critical)
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreatLevel::Info => "info",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
            ThreatLevel::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// IDS alert as decoded from the feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub source_ip: String,
    pub dest_ip: String,
    pub attack_id: String,
    pub threat_level: ThreatLevel,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
}

impl Alert {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            source_ip: self.source_ip.clone(),
            dest_ip: self.dest_ip.clone(),
            attack_id: self.attack_id.clone(),
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey {
            source_ip: self.source_ip.clone(),
            dest_ip: self.dest_ip.clone(),
        }
    }

    /// One-line rendering handed to the planner next to the structured alert
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} {} {} ({}) targeting {}",
            self.timestamp.to_rfc3339(),
            self.source_ip,
            self.attack_id,
            self.proto.as_deref().unwrap_or("unknown"),
            self.dest_ip
        );
        if !self.description.is_empty() {
            line.push_str(" - ");
            line.push_str(&self.description);
        }
        line
    }
}

/// Alert identity used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub source_ip: String,
    pub dest_ip: String,
    pub attack_id: String,
}

impl DedupKey {
    /// Short stable id used to correlate timeline entries (8 hex chars)
    pub fn short_id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.source_ip.as_bytes());
        hasher.update(b"|");
        hasher.update(self.dest_ip.as_bytes());
        hasher.update(b"|");
        hasher.update(self.attack_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..8].to_string()
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.source_ip, self.dest_ip, self.attack_id)
    }
}

/// (source, destination) pair; at most one execution per pair may be active
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PairKey {
    pub source_ip: String,
    pub dest_ip: String,
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_ip, self.dest_ip)
    }
}

/// Remediation plan returned by the planning service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub plan_id: String,
    pub target_ip: String,
    pub actions: Vec<String>,
    pub model: Option<String>,
}

/// Role of a remote host in the lab topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    /// Protected server (alert destination side)
    Server,
    /// Investigated host (alert source side)
    Compromised,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Server => f.write_str("server"),
            HostRole::Compromised => f.write_str("compromised"),
        }
    }
}

/// Resolved remote execution target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetHost {
    pub role: HostRole,
    pub address: String,
}

/// Result of one command run over a remote channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub command: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Succeeded,
    /// Attempt failed, another attempt follows
    Failed,
    /// Last allowed attempt failed
    ExhaustedRetries,
    Cancelled,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Failed)
    }
}

/// One line of the execution log; never mutated once written
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub unit_id: String,
    pub plan_id: String,
    pub target_ip: String,
    pub target_role: HostRole,
    pub mode: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_command: Vec<CommandRecord>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
