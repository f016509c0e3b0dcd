/*!
Alert feed writer

Plays the detection engine's side of the newline-delimited alert feed:
appends records, writes partial lines, truncates in place and rotates the
file the way log rotation does (rename, then recreate).
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct FeedWriter {
    path: PathBuf,
}

impl FeedWriter {
    /// Create (or reuse) the feed file and its parent directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to create feed {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON record followed by a newline
    pub fn append(&self, record: &Value) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.append_raw(&line)
    }

    /// Append bytes verbatim (partial lines, garbage, control records)
    pub fn append_raw(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open feed {}", self.path.display()))?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        log::debug!("[FEED] appended {} bytes to {}", text.len(), self.path.display());
        Ok(())
    }

    /// Truncate the feed in place (same file identity, size drops to zero)
    pub fn truncate(&self) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("Failed to truncate {}", self.path.display()))?;
        Ok(())
    }

    /// Move the current feed to `<name>.1` and start a new empty file
    pub fn rotate(&self) -> Result<PathBuf> {
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        let rotated = PathBuf::from(rotated);

        std::fs::rename(&self.path, &rotated)
            .with_context(|| format!("Failed to rotate {}", self.path.display()))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to recreate {}", self.path.display()))?;
        log::info!("[FEED] rotated {} -> {}", self.path.display(), rotated.display());
        Ok(rotated)
    }
}
