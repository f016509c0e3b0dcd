//! Alert source reader
//!
//! Tails the newline-delimited JSON feed written by the detection engine.
//! The read position is a cursor `{offset, file identity}` that is persisted
//! only once the caller has processed a batch (`commit`), so a restart resumes
//! from the last acknowledged line. A shrinking file or a changed file
//! identity means the feed was rotated/rewritten: reading restarts at 0.

use crate::models::{Alert, ThreatLevel};
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})\b").expect("IPv4 pattern is valid")
});

static THREAT_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)threat[ _]level\s*:?\s*([a-z]+)").expect("threat level pattern is valid")
});

/// Feed notes that are bookkeeping, not detections
const CONTROL_NOTES: [&str; 3] = ["heartbeat", "queued", "completed"];

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("alert feed IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cursor serialization error: {0}")]
    Cursor(#[from] serde_json::Error),
}

/// Wire shape of a feed line; every field is optional so that partially
/// structured detections can still be resolved from their raw text
#[derive(Debug, Deserialize)]
struct RawAlert {
    #[serde(alias = "sourceip", alias = "src_ip")]
    source_ip: Option<String>,
    #[serde(alias = "destip", alias = "dst_ip")]
    dest_ip: Option<String>,
    #[serde(alias = "attackid")]
    attack_id: Option<String>,
    threat_level: Option<String>,
    description: Option<String>,
    timestamp: Option<serde_json::Value>,
    proto: Option<String>,
    raw: Option<String>,
    note: Option<String>,
}

/// One decoded feed line
#[derive(Debug)]
pub enum FeedItem {
    Alert(Alert),
    /// Bookkeeping line from the detection pipeline (heartbeat, queued...)
    Control(String),
    Malformed { line: String, error: ParseError },
}

/// Decode one feed line
pub fn decode_line(line: &str, read_at: DateTime<Utc>) -> FeedItem {
    match try_decode(line, read_at) {
        Ok(Some(alert)) => FeedItem::Alert(alert),
        Ok(None) => FeedItem::Control(line.to_string()),
        Err(error) => FeedItem::Malformed {
            line: line.to_string(),
            error,
        },
    }
}

fn try_decode(line: &str, read_at: DateTime<Utc>) -> Result<Option<Alert>, ParseError> {
    let raw: RawAlert = serde_json::from_str(line)?;

    if let Some(note) = raw.note.as_deref() {
        if CONTROL_NOTES.contains(&note.trim().to_ascii_lowercase().as_str()) {
            return Ok(None);
        }
    }

    let raw_text = raw.raw.clone().unwrap_or_default();
    let raw_ips: Vec<&str> = IPV4
        .captures_iter(&raw_text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let source_ip = non_empty(raw.source_ip)
        .or_else(|| raw_ips.first().map(|s| s.to_string()))
        .ok_or(ParseError::MissingField("source_ip"))?;
    let dest_ip = non_empty(raw.dest_ip)
        .or_else(|| raw_ips.get(1).map(|s| s.to_string()))
        .ok_or(ParseError::MissingField("dest_ip"))?;

    let attack_id = non_empty(raw.attack_id).unwrap_or_else(|| {
        if raw_text.to_ascii_lowercase().contains("vertical port scan") {
            "vertical_port_scan".to_string()
        } else {
            "unknown".to_string()
        }
    });

    let description = non_empty(raw.description).unwrap_or_else(|| raw_text.clone());

    let threat_level = match non_empty(raw.threat_level) {
        Some(level) => ThreatLevel::parse(&level),
        None => THREAT_LEVEL
            .captures(&raw_text)
            .or_else(|| THREAT_LEVEL.captures(&description))
            .and_then(|c| c.get(1))
            .map(|m| ThreatLevel::parse(m.as_str()))
            .unwrap_or(ThreatLevel::Unknown),
    };

    let timestamp = match raw.timestamp {
        None | Some(serde_json::Value::Null) => read_at,
        Some(value) => parse_timestamp(&value)?,
    };

    Ok(Some(Alert {
        source_ip,
        dest_ip,
        attack_id,
        threat_level,
        description,
        timestamp,
        proto: non_empty(raw.proto),
    }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>, ParseError> {
    match value {
        serde_json::Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| ParseError::InvalidTimestamp(n.to_string()))?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs.fract()) * 1e9).round() as u32;
            Utc.timestamp_opt(whole, nanos.min(999_999_999))
                .single()
                .ok_or_else(|| ParseError::InvalidTimestamp(n.to_string()))
        }
        serde_json::Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s.trim()) {
                return Ok(ts.with_timezone(&Utc));
            }
            if let Ok(naive) =
                chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f")
            {
                return Ok(naive.and_utc());
            }
            if let Ok(secs) = s.trim().parse::<f64>() {
                return parse_timestamp(&serde_json::json!(secs));
            }
            Err(ParseError::InvalidTimestamp(s.clone()))
        }
        other => Err(ParseError::InvalidTimestamp(other.to_string())),
    }
}

/// Identity of the underlying file, used to detect replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Persisted read position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCursor {
    pub offset: u64,
    pub identity: Option<FileIdentity>,
}

/// Lines read by one `poll`, decoded lazily while iterating
#[derive(Debug)]
pub struct FeedBatch {
    lines: std::vec::IntoIter<String>,
    read_at: DateTime<Utc>,
    /// The feed was truncated or replaced since the previous poll
    pub rotated: bool,
}

#[cfg(test)]
impl FeedBatch {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 0
    }
}

impl Iterator for FeedBatch {
    type Item = FeedItem;

    fn next(&mut self) -> Option<FeedItem> {
        loop {
            let line = self.lines.next()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(decode_line(trimmed, self.read_at));
        }
    }
}

/// Position-tracked reader over the append-only alert feed
pub struct AlertFeed {
    path: PathBuf,
    cursor_path: Option<PathBuf>,
    cursor: FeedCursor,
    /// Position reached by the last poll, not yet acknowledged
    pending: Option<FeedCursor>,
}

impl AlertFeed {
    /// Open the feed (creating it if needed) and restore the cursor
    pub async fn open<P: AsRef<Path>>(path: P, cursor_path: Option<PathBuf>) -> Result<Self, FeedError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| FeedError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        let cursor = match &cursor_path {
            Some(cp) if cp.exists() => {
                let content = tokio::fs::read_to_string(cp).await.map_err(|source| FeedError::Io {
                    path: cp.clone(),
                    source,
                })?;
                match serde_json::from_str::<FeedCursor>(&content) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        warn!("ignoring unreadable feed cursor {}: {}", cp.display(), e);
                        FeedCursor::default()
                    }
                }
            }
            _ => FeedCursor::default(),
        };

        info!(
            "tailing alert feed {} from offset {}",
            path.display(),
            cursor.offset
        );

        Ok(Self {
            path,
            cursor_path,
            cursor,
            pending: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete line appended since the acknowledged position
    pub async fn poll(&mut self) -> Result<FeedBatch, FeedError> {
        let read_at = Utc::now();
        let io_err = |source| FeedError::Io {
            path: self.path.clone(),
            source,
        };

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // rotated away and not recreated yet
                return Ok(FeedBatch {
                    lines: Vec::new().into_iter(),
                    read_at,
                    rotated: false,
                });
            }
            Err(e) => return Err(io_err(e)),
        };

        let identity = FileIdentity::of(&meta);
        let mut start = self.pending.unwrap_or(self.cursor);
        let mut rotated = false;

        let replaced = matches!(
            (start.identity, identity),
            (Some(previous), Some(current)) if previous != current
        );
        if replaced || meta.len() < start.offset {
            warn!(
                "alert feed {} was rotated or truncated (offset {} > len {}), rereading from start",
                self.path.display(),
                start.offset,
                meta.len()
            );
            start = FeedCursor {
                offset: 0,
                identity,
            };
            rotated = true;
        }

        let mut lines = Vec::new();
        let mut end = start.offset;
        if meta.len() > start.offset {
            let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
            file.seek(std::io::SeekFrom::Start(start.offset))
                .await
                .map_err(io_err)?;
            let mut buf = Vec::with_capacity((meta.len() - start.offset) as usize);
            file.read_to_end(&mut buf).await.map_err(io_err)?;

            // a trailing line without newline is still being written
            if let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') {
                let complete = &buf[..=last_newline];
                end = start.offset + complete.len() as u64;
                lines = String::from_utf8_lossy(complete)
                    .lines()
                    .map(str::to_string)
                    .collect();
            }
        }

        debug!("read {} feed lines ({} -> {})", lines.len(), start.offset, end);
        self.pending = Some(FeedCursor {
            offset: end,
            identity,
        });

        Ok(FeedBatch {
            lines: lines.into_iter(),
            read_at,
            rotated,
        })
    }

    /// Acknowledge everything returned by the last `poll`
    pub async fn commit(&mut self) -> Result<(), FeedError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if pending == self.cursor {
            return Ok(());
        }
        self.cursor = pending;

        if let Some(cp) = &self.cursor_path {
            let content = serde_json::to_string(&self.cursor)?;
            let tmp = cp.with_extension("json.tmp");
            let io_err = |source| FeedError::Io {
                path: cp.clone(),
                source,
            };
            tokio::fs::write(&tmp, content).await.map_err(io_err)?;
            tokio::fs::rename(&tmp, cp).await.map_err(io_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use responder_devkit::{AlertBuilder, FeedWriter};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_decode_structured_alert() {
        let line = r#"{"source_ip":"172.30.0.10","dest_ip":"172.31.0.10","attack_id":"portscan-1","threat_level":"high","description":"vertical scan","timestamp":"2025-01-01T10:00:00Z","proto":"TCP"}"#;
        let FeedItem::Alert(alert) = decode_line(line, now()) else {
            panic!("expected alert");
        };
        assert_eq!(alert.source_ip, "172.30.0.10");
        assert_eq!(alert.dest_ip, "172.31.0.10");
        assert_eq!(alert.attack_id, "portscan-1");
        assert_eq!(alert.threat_level, ThreatLevel::High);
        assert_eq!(alert.proto.as_deref(), Some("TCP"));
        assert_eq!(alert.timestamp.to_rfc3339(), "2025-01-01T10:00:00+00:00");
    }

    #[test]
    fn test_decode_legacy_field_names_and_epoch_timestamp() {
        let line = r#"{"sourceip":"10.0.0.1","destip":"10.0.0.2","attackid":"ssh-brute","threat_level":"Critical","timestamp":1735725600.5}"#;
        let FeedItem::Alert(alert) = decode_line(line, now()) else {
            panic!("expected alert");
        };
        assert_eq!(alert.source_ip, "10.0.0.1");
        assert_eq!(alert.attack_id, "ssh-brute");
        assert_eq!(alert.threat_level, ThreatLevel::Critical);
        assert_eq!(alert.timestamp.timestamp(), 1_735_725_600);
        assert_eq!(alert.timestamp.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_decode_raw_slips_line() {
        let line = r#"{"raw":"2025-01-01T10:00:00 Src IP 172.30.0.10 vertical port scan to IP 172.31.0.10. threat level: high.","run_id":"r1"}"#;
        let FeedItem::Alert(alert) = decode_line(line, now()) else {
            panic!("expected alert");
        };
        assert_eq!(alert.source_ip, "172.30.0.10");
        assert_eq!(alert.dest_ip, "172.31.0.10");
        assert_eq!(alert.attack_id, "vertical_port_scan");
        assert_eq!(alert.threat_level, ThreatLevel::High);
        assert!(alert.description.contains("vertical port scan"));
    }

    #[test]
    fn test_control_and_malformed_lines() {
        assert!(matches!(
            decode_line(r#"{"note":"heartbeat","ts":1}"#, now()),
            FeedItem::Control(_)
        ));
        assert!(matches!(
            decode_line("not json at all", now()),
            FeedItem::Malformed { error: ParseError::Json(_), .. }
        ));
        assert!(matches!(
            decode_line(r#"{"attack_id":"x","threat_level":"high"}"#, now()),
            FeedItem::Malformed { error: ParseError::MissingField("source_ip"), .. }
        ));
        assert!(matches!(
            decode_line(
                r#"{"source_ip":"1.1.1.1","dest_ip":"2.2.2.2","timestamp":"yesterday"}"#,
                now()
            ),
            FeedItem::Malformed { error: ParseError::InvalidTimestamp(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_poll_reads_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FeedWriter::new(dir.path().join("alerts.ndjson")).unwrap();
        let mut feed = AlertFeed::open(writer.path(), None).await.unwrap();

        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack("a").build()).unwrap();
        writer.append_raw("{\"source_ip\":\"10.0.0.3\"").unwrap();

        let batch = feed.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        let items: Vec<_> = batch.collect();
        assert!(matches!(&items[0], FeedItem::Alert(a) if a.attack_id == "a"));
        feed.commit().await.unwrap();

        // finish the partial line
        writer.append_raw(",\"dest_ip\":\"10.0.0.4\",\"threat_level\":\"high\"}\n").unwrap();
        let items: Vec<_> = feed.poll().await.unwrap().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], FeedItem::Alert(a) if a.source_ip == "10.0.0.3"));
        feed.commit().await.unwrap();

        assert!(feed.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncation_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FeedWriter::new(dir.path().join("alerts.ndjson")).unwrap();
        let mut feed = AlertFeed::open(writer.path(), None).await.unwrap();

        for i in 0..3 {
            writer
                .append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack(&format!("a{i}")).build())
                .unwrap();
        }
        assert_eq!(feed.poll().await.unwrap().count(), 3);
        feed.commit().await.unwrap();

        writer.truncate().unwrap();
        writer.append(&AlertBuilder::new("10.0.0.9", "10.0.0.2").build()).unwrap();

        let batch = feed.poll().await.unwrap();
        assert!(batch.rotated);
        let items: Vec<_> = batch.collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], FeedItem::Alert(a) if a.source_ip == "10.0.0.9"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_by_replacement_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FeedWriter::new(dir.path().join("alerts.ndjson")).unwrap();
        let mut feed = AlertFeed::open(writer.path(), None).await.unwrap();

        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack("old").build()).unwrap();
        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack("old2").build()).unwrap();
        assert_eq!(feed.poll().await.unwrap().count(), 2);
        feed.commit().await.unwrap();

        // new file, longer than the old offset, different inode
        writer.rotate().unwrap();
        for i in 0..4 {
            writer
                .append(&AlertBuilder::new("10.0.0.5", "10.0.0.2").attack(&format!("new{i}")).build())
                .unwrap();
        }

        let batch = feed.poll().await.unwrap();
        assert!(batch.rotated);
        assert_eq!(batch.count(), 4);
    }

    #[tokio::test]
    async fn test_cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join("alert_cursor.json");
        let writer = FeedWriter::new(dir.path().join("alerts.ndjson")).unwrap();

        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack("first").build()).unwrap();
        {
            let mut feed = AlertFeed::open(writer.path(), Some(cursor_path.clone())).await.unwrap();
            assert_eq!(feed.poll().await.unwrap().count(), 1);
            feed.commit().await.unwrap();
        }

        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").attack("second").build()).unwrap();
        let mut feed = AlertFeed::open(writer.path(), Some(cursor_path)).await.unwrap();
        let items: Vec<_> = feed.poll().await.unwrap().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], FeedItem::Alert(a) if a.attack_id == "second"));
    }

    #[tokio::test]
    async fn test_unacknowledged_batch_is_redelivered_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join("alert_cursor.json");
        let writer = FeedWriter::new(dir.path().join("alerts.ndjson")).unwrap();
        writer.append(&AlertBuilder::new("10.0.0.1", "10.0.0.2").build()).unwrap();

        {
            let mut feed = AlertFeed::open(writer.path(), Some(cursor_path.clone())).await.unwrap();
            assert_eq!(feed.poll().await.unwrap().count(), 1);
            // crash before commit
        }

        let mut feed = AlertFeed::open(writer.path(), Some(cursor_path)).await.unwrap();
        assert_eq!(feed.poll().await.unwrap().count(), 1);
    }
}
