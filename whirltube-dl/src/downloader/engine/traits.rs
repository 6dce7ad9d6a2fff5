//! Download task trait and related types.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;
use crate::models::{DownloadOptions, Video};

/// Identifier of a job in the queue.
pub type JobId = String;

/// Execution strategy backing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// In-process library call on a blocking worker.
    Library,
    /// Engine binary driven through a `ProcessRunner`.
    Subprocess,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Library => "library",
            Self::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by a progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Queued,
    Downloading,
    Finished,
    /// The engine found the file already present and transferred nothing.
    Skipped,
    Error,
    Cancelled,
}

impl DownloadStatus {
    /// Whether a task sends nothing after this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Skipped | Self::Error | Self::Cancelled
        )
    }
}

/// Latest known progress of one download.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// Total size, if the engine knows or estimates it.
    pub bytes_total: Option<u64>,
    /// Transfer speed in bytes per second.
    pub speed_bps: Option<f64>,
    pub eta_secs: Option<u64>,
    /// Resolved output file, once known.
    pub filename: Option<String>,
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn with_status(mut self, status: DownloadStatus) -> Self {
        self.status = status;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = DownloadStatus::Error;
        self.error = Some(error.into());
        self
    }

    /// Completed fraction in `[0, 1]`, zero when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if matches!(self.status, DownloadStatus::Finished | DownloadStatus::Skipped) {
            return 1.0;
        }
        match self.bytes_total {
            Some(total) if total > 0 => (self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    /// Short text for a progress bar.
    pub fn progress_text(&self) -> String {
        match self.status {
            DownloadStatus::Finished | DownloadStatus::Skipped => "100% (done)".to_string(),
            _ => match self.bytes_total {
                Some(total) if total > 0 => format!("{}%", (self.fraction() * 100.0) as u32),
                _ if self.bytes_downloaded > 0 => {
                    format!("{:.1} KiB", self.bytes_downloaded as f64 / 1024.0)
                }
                _ => String::new(),
            },
        }
    }

    /// One-line status description.
    pub fn status_text(&self) -> String {
        match self.status {
            DownloadStatus::Finished => {
                format!("Saved: {}", self.filename.as_deref().unwrap_or_default())
            }
            DownloadStatus::Skipped => "Skipped: already downloaded".to_string(),
            DownloadStatus::Error => {
                format!("Error: {}", self.error.as_deref().unwrap_or("unknown"))
            }
            DownloadStatus::Cancelled => "Cancelled".to_string(),
            DownloadStatus::Queued | DownloadStatus::Downloading => {
                let mut parts = Vec::new();
                if let Some(speed) = self.speed_bps.filter(|s| *s > 0.0) {
                    parts.push(format!("{:.2} MiB/s", speed / (1024.0 * 1024.0)));
                }
                if let Some(eta) = self.eta_secs.filter(|e| *e > 0) {
                    parts.push(format!("ETA {eta}s"));
                }
                parts.join(" • ")
            }
        }
    }
}

/// Everything a task needs to run one job.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub video: Video,
    pub options: DownloadOptions,
    /// Existing destination directory.
    pub dest_dir: PathBuf,
}

impl DownloadRequest {
    pub fn new(video: Video, options: DownloadOptions, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            video,
            options,
            dest_dir: dest_dir.into(),
        }
    }
}

/// Progress report posted back to the queue.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub job_id: JobId,
    /// Run number assigned when the job was dispatched.
    pub run: u64,
    pub snapshot: ProgressSnapshot,
}

/// Channel through which a running task reports progress.
///
/// Every report is tagged with the job and run it belongs to, so the queue
/// can drop reports from runs it no longer tracks.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    job_id: JobId,
    run: u64,
    tx: mpsc::Sender<TaskReport>,
}

impl ProgressSink {
    pub fn new(job_id: impl Into<JobId>, run: u64, tx: mpsc::Sender<TaskReport>) -> Self {
        Self {
            job_id: job_id.into(),
            run,
            tx,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn report_for(&self, snapshot: ProgressSnapshot) -> TaskReport {
        TaskReport {
            job_id: self.job_id.clone(),
            run: self.run,
            snapshot,
        }
    }

    /// Send a report, waiting for channel capacity.
    ///
    /// Returns `false` once the queue has shut down.
    pub async fn report(&self, snapshot: ProgressSnapshot) -> bool {
        self.tx.send(self.report_for(snapshot)).await.is_ok()
    }

    /// Send a report from a blocking worker thread.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_report(&self, snapshot: ProgressSnapshot) -> bool {
        self.tx.blocking_send(self.report_for(snapshot)).is_ok()
    }
}

/// One way of running a single download.
///
/// Implementations report through the [`ProgressSink`] passed to `start` and
/// send exactly one terminal snapshot, which is their last report.
#[async_trait]
pub trait DownloadTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Begin the download in the background.
    ///
    /// Calling `start` while the task is running is a no-op. An error means
    /// no background work was started and nothing will be reported.
    async fn start(&self, sink: ProgressSink) -> Result<()>;

    /// Request the download to stop.
    ///
    /// Best-effort and bounded in time. Never fails.
    async fn stop(&self);

    fn is_running(&self) -> bool;
}
