//! Desktop notifications for finished and failed downloads.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::downloader::engine::{DownloadStatus, ProgressSnapshot};
use crate::{Error, Result};

/// Application name shown by the notification daemon.
pub const APP_NAME: &str = "WhirlTube";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A notification about one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub summary: String,
    pub body: String,
}

impl Notification {
    /// Notification for a terminal snapshot, if the status warrants one.
    ///
    /// Only successful and failed downloads notify.
    pub fn for_outcome(title: &str, snapshot: &ProgressSnapshot) -> Option<Self> {
        match snapshot.status {
            DownloadStatus::Finished => Some(Self {
                summary: "Download complete".to_string(),
                body: snapshot
                    .filename
                    .as_deref()
                    .map(file_name)
                    .unwrap_or(title)
                    .to_string(),
            }),
            DownloadStatus::Error => Some(Self {
                summary: "Download failed".to_string(),
                body: match snapshot.error.as_deref() {
                    Some(error) => format!("{title}: {error}"),
                    None => title.to_string(),
                },
            }),
            _ => None,
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel_type(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Sends notifications through `notify-send`.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    program: String,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new("notify-send")
    }
}

impl DesktopNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn channel_type(&self) -> &'static str {
        "desktop"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut command = process_utils::tokio_command(&self.program);
        command
            .arg(format!("--app-name={APP_NAME}"))
            .arg(&notification.summary)
            .arg(&notification.body)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(SEND_TIMEOUT, command.status())
            .await
            .map_err(|_| Error::Other(format!("{} timed out", self.program)))?
            .map_err(|e| Error::Other(format!("Failed to run {}: {}", self.program, e)))?;

        if !status.success() {
            return Err(Error::Other(format!("{} exited with {}", self.program, status)));
        }
        debug!("Sent desktop notification: {}", notification.summary);
        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel_type(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        info!("{}: {}", notification.summary, notification.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_uses_file_name() {
        let snapshot = ProgressSnapshot {
            filename: Some("/videos/Clip [abc].mp4".into()),
            ..Default::default()
        }
        .with_status(DownloadStatus::Finished);

        let n = Notification::for_outcome("Clip", &snapshot).unwrap();
        assert_eq!(n.summary, "Download complete");
        assert_eq!(n.body, "Clip [abc].mp4");
    }

    #[test]
    fn finished_without_file_uses_title() {
        let snapshot = ProgressSnapshot::default().with_status(DownloadStatus::Finished);
        let n = Notification::for_outcome("Clip", &snapshot).unwrap();
        assert_eq!(n.body, "Clip");
    }

    #[test]
    fn error_carries_message() {
        let snapshot = ProgressSnapshot::default().failed("HTTP Error 403");
        let n = Notification::for_outcome("Clip", &snapshot).unwrap();
        assert_eq!(n.summary, "Download failed");
        assert_eq!(n.body, "Clip: HTTP Error 403");
    }

    #[test]
    fn other_outcomes_stay_quiet() {
        for status in [DownloadStatus::Cancelled, DownloadStatus::Skipped] {
            let snapshot = ProgressSnapshot::default().with_status(status);
            assert!(Notification::for_outcome("Clip", &snapshot).is_none());
        }
    }

    #[tokio::test]
    async fn missing_notifier_binary_is_an_error() {
        let notifier = DesktopNotifier::new("/nonexistent/notify-send");
        let n = Notification {
            summary: "s".into(),
            body: "b".into(),
        };
        assert!(notifier.send(&n).await.is_err());
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let n = Notification {
            summary: "s".into(),
            body: "b".into(),
        };
        assert!(LogNotifier.send(&n).await.is_ok());
    }
}
