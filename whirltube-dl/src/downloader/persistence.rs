//! Queue snapshot persistence.
//!
//! The not-yet-started part of the queue is stored as a JSON array at
//! `<data_dir>/download_queue.json`. Writes go through a single writer task
//! so that snapshots reach the disk in the order they were taken.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::models::{DownloadOptions, Video};
use crate::utils::fs::write_atomic;
use crate::{Error, Result};

/// One queued job in the snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub video: Video,
    pub opts: DownloadOptions,
    pub dest_dir: PathBuf,
    /// Kept for readability of the file; the video carries the title too.
    #[serde(default)]
    pub title: String,
}

impl QueueEntry {
    pub fn new(video: Video, opts: DownloadOptions, dest_dir: PathBuf) -> Self {
        let title = video.title.clone();
        Self {
            video,
            opts,
            dest_dir,
            title,
        }
    }

    /// Options to resubmit with, destination restored into `target_dir`.
    pub fn into_submission(self) -> (Video, DownloadOptions) {
        let mut opts = self.opts;
        opts.target_dir = Some(self.dest_dir);
        (self.video, opts)
    }
}

enum WriterCommand {
    Save(Vec<QueueEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the snapshot file and its writer task.
#[derive(Clone)]
pub struct QueueStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl QueueStore {
    /// Create a store for `path` and spawn its writer task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a snapshot for writing. Never blocks.
    pub fn save(&self, entries: Vec<QueueEntry>) {
        if self.tx.send(WriterCommand::Save(entries)).is_err() {
            warn!("Queue writer for {} has stopped", self.path.display());
        }
    }

    /// Wait until every snapshot queued so far has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub async fn load(&self) -> Result<Vec<QueueEntry>> {
        load_queue(self.path.clone()).await
    }
}

/// Read a snapshot file.
///
/// A missing file is an empty queue. Entries that do not decode are
/// skipped; a file that is not a JSON array is a persistence error.
pub async fn load_queue(path: PathBuf) -> Result<Vec<QueueEntry>> {
    tokio::task::spawn_blocking(move || load_entries(&path))
        .await
        .map_err(|e| Error::persistence(format!("Queue load task failed: {e}")))?
}

fn load_entries(path: &Path) -> Result<Vec<QueueEntry>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::persistence(format!(
                "Cannot read {}: {}",
                path.display(),
                e
            )));
        }
    };

    let values: Vec<serde_json::Value> = serde_json::from_str(&raw).map_err(|e| {
        Error::persistence(format!("Invalid queue file {}: {}", path.display(), e))
    })?;

    let mut entries = Vec::with_capacity(values.len());
    for (idx, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<QueueEntry>(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed queue entry #{}: {}", idx, e),
        }
    }
    Ok(entries)
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            WriterCommand::Save(mut entries) => {
                // Only the newest of several pending snapshots matters.
                let mut acks = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WriterCommand::Save(newer) => entries = newer,
                        WriterCommand::Flush(ack) => {
                            acks.push(ack);
                            break;
                        }
                    }
                }

                write_snapshot(&path, entries).await;
                for ack in acks {
                    let _ = ack.send(());
                }
            }
        }
    }
    debug!("Queue writer for {} stopped", path.display());
}

async fn write_snapshot(path: &Path, entries: Vec<QueueEntry>) {
    let count = entries.len();
    let json = match serde_json::to_vec_pretty(&entries) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize queue snapshot: {}", e);
            return;
        }
    };

    let target = path.to_path_buf();
    match tokio::task::spawn_blocking(move || write_atomic(&target, &json)).await {
        Ok(Ok(())) => debug!("Persisted {} queued downloads to {}", count, path.display()),
        Ok(Err(e)) => warn!("Failed to persist queue to {}: {}", path.display(), e),
        Err(e) => warn!("Queue write task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry::new(
            Video::new(id, format!("Title {id}"), format!("https://example.com/{id}")),
            DownloadOptions {
                write_subs: true,
                subs_langs: "en".into(),
                target_dir: Some(PathBuf::from("/ignored")),
                ..Default::default()
            },
            PathBuf::from("/videos"),
        )
    }

    #[tokio::test]
    async fn missing_file_is_empty_queue() {
        let temp = TempDir::new().unwrap();
        let store = QueueStore::spawn(temp.path().join("download_queue.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_flush_load() {
        let temp = TempDir::new().unwrap();
        let store = QueueStore::spawn(temp.path().join("download_queue.json"));

        store.save(vec![entry("a"), entry("b")]);
        store.flush().await;

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].video.id, "a");
        assert_eq!(loaded[1].title, "Title b");
        assert_eq!(loaded[0].dest_dir, PathBuf::from("/videos"));
        // The destination lives in dest_dir only.
        assert_eq!(loaded[0].opts.target_dir, None);
        assert!(loaded[0].opts.write_subs);
    }

    #[tokio::test]
    async fn later_snapshot_wins() {
        let temp = TempDir::new().unwrap();
        let store = QueueStore::spawn(temp.path().join("download_queue.json"));

        store.save(vec![entry("a"), entry("b"), entry("c")]);
        store.save(vec![entry("c")]);
        store.save(Vec::new());
        store.save(vec![entry("d")]);
        store.flush().await;

        let loaded = store.load().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|e| e.video.id.as_str()).collect();
        assert_eq!(ids, vec!["d"]);
        assert!(!temp.path().join("download_queue.json.tmp").exists());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("download_queue.json");
        let good = serde_json::to_value(entry("ok")).unwrap();
        let raw = serde_json::json!([good, {"video": 42}, "junk", {"opts": {}}]);
        std::fs::write(&path, raw.to_string()).unwrap();

        let loaded = QueueStore::spawn(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].video.id, "ok");
    }

    #[tokio::test]
    async fn non_array_file_is_persistence_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("download_queue.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").unwrap();

        let err = QueueStore::spawn(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn submission_restores_destination() {
        let (video, opts) = entry("a").into_submission();
        assert_eq!(video.id, "a");
        assert_eq!(opts.target_dir, Some(PathBuf::from("/videos")));
    }

    #[tokio::test]
    async fn unwritable_location_is_swallowed() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let store = QueueStore::spawn(blocker.join("download_queue.json"));
        store.save(vec![entry("a")]);
        store.flush().await;
        assert!(!blocker.join("download_queue.json").exists());
    }
}
