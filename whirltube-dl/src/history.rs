//! Append-only log of finished downloads.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::models::Video;
use crate::utils::fs::append_line;

/// Entries returned by [`DownloadHistory::list`] when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 300;

/// One line of the history file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub thumb_url: Option<String>,
    #[serde(default)]
    pub kind: String,
    pub dest_dir: String,
    #[serde(default)]
    pub filename: Option<String>,
    /// Unix timestamp in seconds.
    pub ts: i64,
}

impl HistoryRecord {
    pub fn new(video: &Video, dest_dir: &Path, filename: Option<String>) -> Self {
        Self {
            id: video.id.clone(),
            title: video.title.clone(),
            url: video.url.clone(),
            channel: video.channel.clone(),
            duration: video.duration,
            thumb_url: video.thumb_url.clone(),
            kind: video.kind.clone(),
            dest_dir: dest_dir.to_string_lossy().into_owned(),
            filename,
            ts: Utc::now().timestamp(),
        }
    }
}

/// JSON-lines history file. All methods block.
#[derive(Debug, Clone)]
pub struct DownloadHistory {
    path: PathBuf,
}

impl DownloadHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        append_line(&self.path, &line)?;
        debug!("Recorded {} in download history", record.id);
        Ok(())
    }

    /// Most recent records first. Lines that fail to decode are skipped.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(raw
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(limit)
            .collect())
    }
}
