//! Responder configuration
//!
//! Layering: defaults, then the optional YAML file named by `RESPONDER_CONFIG`,
//! then individual environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// What to do when a pool for a target expires while that target still runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolTieBreak {
    /// Flush on the pool's own timer, concurrently with the running unit
    Fresh,
    /// Hold the expired pool until the running unit for that target finishes
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub known_hosts: PathBuf,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            key_path: PathBuf::from("/root/.ssh/id_rsa_auto_responder"),
            known_hosts: PathBuf::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub run_id: String,
    pub output_dir: PathBuf,
    /// Explicit feed path; defaults to `<output_dir>/<run_id>/defender_alerts.ndjson`
    pub alert_file: Option<PathBuf>,
    pub planner_url: String,
    pub planner_timeout_secs: u64,
    pub opencode_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub duplicate_window_secs: u64,
    pub max_execution_retries: u32,
    pub retry_backoff_secs: f64,
    pub enable_multi_alert: bool,
    pub alert_pool_window_secs: u64,
    pub multi_alert_delay_secs: f64,
    pub pool_tie_break: PoolTieBreak,
    pub server_ip: String,
    pub compromised_ip: String,
    pub shutdown_grace_secs: u64,
    pub ssh: SshConfig,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            run_id: "run_local".into(),
            output_dir: PathBuf::from("/outputs"),
            alert_file: None,
            planner_url: "http://127.0.0.1:1654/plan".into(),
            planner_timeout_secs: 30,
            opencode_timeout_secs: 600,
            poll_interval_secs: 5,
            duplicate_window_secs: 300,
            max_execution_retries: 3,
            retry_backoff_secs: 10.0,
            enable_multi_alert: false,
            alert_pool_window_secs: 10,
            multi_alert_delay_secs: 0.5,
            pool_tie_break: PoolTieBreak::Fresh,
            server_ip: "172.31.0.10".into(),
            compromised_ip: "172.30.0.10".into(),
            shutdown_grace_secs: 10,
            ssh: SshConfig::default(),
        }
    }
}

impl ResponderConfig {
    /// Load from `RESPONDER_CONFIG` (if set) and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("RESPONDER_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(&path))?,
            _ => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply variable overrides taken from `lookup` (the environment in production)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RUN_ID") {
            self.run_id = v;
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ALERT_FILE") {
            self.alert_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PLANNER_URL") {
            self.planner_url = v;
        }
        if let Some(v) = get("PLANNER_TIMEOUT") {
            self.planner_timeout_secs = parse_num("PLANNER_TIMEOUT", &v)?;
        }
        if let Some(v) = get("OPENCODE_TIMEOUT") {
            self.opencode_timeout_secs = parse_num("OPENCODE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("AUTO_RESPONDER_INTERVAL") {
            self.poll_interval_secs = parse_num("AUTO_RESPONDER_INTERVAL", &v)?;
        }
        if let Some(v) = get("DUPLICATE_DETECTION_WINDOW") {
            self.duplicate_window_secs = parse_num("DUPLICATE_DETECTION_WINDOW", &v)?;
        }
        if let Some(v) = get("MAX_EXECUTION_RETRIES") {
            self.max_execution_retries = parse_num("MAX_EXECUTION_RETRIES", &v)?;
        }
        if let Some(v) = get("EXECUTION_RETRY_BACKOFF") {
            self.retry_backoff_secs = parse_secs_f64("EXECUTION_RETRY_BACKOFF", &v)?;
        }
        if let Some(v) = get("ENABLE_MULTI_ALERT") {
            self.enable_multi_alert = parse_bool("ENABLE_MULTI_ALERT", &v)?;
        }
        if let Some(v) = get("ALERT_POOL_WINDOW") {
            self.alert_pool_window_secs = parse_num("ALERT_POOL_WINDOW", &v)?;
        }
        if let Some(v) = get("MULTI_ALERT_DELAY") {
            self.multi_alert_delay_secs = parse_secs_f64("MULTI_ALERT_DELAY", &v)?;
        }
        if let Some(v) = get("ALERT_POOL_TIE_BREAK") {
            self.pool_tie_break = match v.trim().to_ascii_lowercase().as_str() {
                "fresh" => PoolTieBreak::Fresh,
                "defer" => PoolTieBreak::Defer,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ALERT_POOL_TIE_BREAK",
                        value: v,
                        reason: "expected fresh or defer".into(),
                    })
                }
            };
        }
        if let Some(v) = get("SERVER_IP") {
            self.server_ip = v;
        }
        if let Some(v) = get("COMPROMISED_IP") {
            self.compromised_ip = v;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.shutdown_grace_secs = parse_num("SHUTDOWN_GRACE", &v)?;
        }
        if let Some(v) = get("SSH_USER") {
            self.ssh.user = v;
        }
        if let Some(v) = get("SSH_PORT") {
            self.ssh.port = parse_num("SSH_PORT", &v)?;
        }
        if let Some(v) = get("SSH_KEY_PATH") {
            self.ssh.key_path = PathBuf::from(v);
        }
        if let Some(v) = get("SSH_KNOWN_HOSTS") {
            self.ssh.known_hosts = PathBuf::from(v);
        }
        if let Some(v) = get("SSH_CONNECT_TIMEOUT") {
            self.ssh.connect_timeout_secs = parse_num("SSH_CONNECT_TIMEOUT", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Fractional durations must convert to `Duration` whichever layer set them
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("retry_backoff_secs", self.retry_backoff_secs)?;
        check_secs("multi_alert_delay_secs", self.multi_alert_delay_secs)?;
        Ok(())
    }

    /// Directory holding every artifact of this run
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_id)
    }

    pub fn alert_file(&self) -> PathBuf {
        self.alert_file
            .clone()
            .unwrap_or_else(|| self.run_dir().join("defender_alerts.ndjson"))
    }

    pub fn dedup_state_file(&self) -> PathBuf {
        self.run_dir().join("processed_alerts.json")
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.run_dir().join("alert_cursor.json")
    }

    pub fn activity_log_file(&self) -> PathBuf {
        self.run_dir().join("auto_responder_detailed.log")
    }

    pub fn timeline_file(&self) -> PathBuf {
        self.run_dir().join("auto_responder_timeline.jsonl")
    }

    pub fn execution_log_file(&self) -> PathBuf {
        self.run_dir().join("auto_responder_executions.jsonl")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.opencode_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_backoff_secs).unwrap_or_default()
    }

    pub fn pool_window(&self) -> Duration {
        Duration::from_secs(self.alert_pool_window_secs)
    }

    pub fn multi_alert_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.multi_alert_delay_secs).unwrap_or_default()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_num<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_secs_f64(key: &'static str, value: &str) -> Result<f64, ConfigError> {
    let secs: f64 = parse_num(key, value)?;
    check_secs(key, secs)?;
    Ok(secs)
}

fn check_secs(key: &'static str, secs: f64) -> Result<(), ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
            reason: format!("expected a non-negative number of seconds ({})", e),
        })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}
