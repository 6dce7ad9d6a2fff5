//! Library strategy: run an in-process engine call on a blocking worker.
//!
//! The engine is reached through the [`ExtractorLibrary`] trait. It calls a
//! progress hook synchronously on every tick; the hook checks the task's
//! cancellation token and answers [`ControlFlow::Break`] to make the engine
//! abort.

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::traits::{
    DownloadRequest, DownloadStatus, DownloadTask, ProgressSink, ProgressSnapshot, TaskKind,
};
use crate::Result;
use crate::config::DownloadSettings;

/// Upper bound on how long `stop` waits for the engine call to return.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine options the library seam understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryOptions {
    pub format: Option<String>,
    pub format_sort: Option<String>,
    pub write_subtitles: bool,
    pub subtitle_langs: Vec<String>,
    pub write_auto_subtitles: bool,
    pub subtitle_format: Option<String>,
    /// Container used when separate video and audio streams are merged.
    pub merge_output_format: String,
    pub retries: u32,
    pub fragment_retries: u32,
    pub proxy: Option<String>,
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            format: None,
            format_sort: None,
            write_subtitles: false,
            subtitle_langs: Vec::new(),
            write_auto_subtitles: false,
            subtitle_format: None,
            merge_output_format: "mp4".to_string(),
            retries: 3,
            fragment_retries: 2,
            proxy: None,
        }
    }
}

/// One engine call.
#[derive(Debug, Clone)]
pub struct LibraryRequest {
    pub url: String,
    /// Output template including the destination directory.
    pub output_template: String,
    pub options: LibraryOptions,
    /// Cancelled when the job is stopped. Engines that can go quiet between
    /// hook calls should watch it directly.
    pub cancel: CancellationToken,
}

/// Status record passed to the progress hook.
#[derive(Debug, Clone, PartialEq)]
pub enum HookStatus {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    },
    /// A file was written; more may follow while formats are merged.
    Finished { filename: Option<String> },
    /// The output is already present and will not be downloaded again.
    AlreadyDownloaded { filename: Option<String> },
}

/// Failure of an engine call.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// The hook asked the engine to stop.
    #[error("download aborted")]
    Aborted,
    #[error("{0}")]
    Failed(String),
}

/// Progress hook handed to [`ExtractorLibrary::download`].
pub type ProgressHook<'a> = dyn FnMut(HookStatus) -> ControlFlow<()> + 'a;

/// An engine callable in-process.
pub trait ExtractorLibrary: Send + Sync {
    fn name(&self) -> &str;

    /// Download synchronously, calling `hook` on every progress tick.
    ///
    /// When `hook` returns [`ControlFlow::Break`] or `request.cancel` fires,
    /// the call must stop and return [`LibraryError::Aborted`]. The hook is
    /// never called after this method returns.
    fn download(
        &self,
        request: &LibraryRequest,
        hook: &mut ProgressHook<'_>,
    ) -> std::result::Result<(), LibraryError>;
}

/// Runs one job through an [`ExtractorLibrary`].
pub struct LibraryTask {
    request: DownloadRequest,
    settings: Arc<DownloadSettings>,
    library: Arc<dyn ExtractorLibrary>,
    cancel: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LibraryTask {
    pub fn new(
        request: DownloadRequest,
        settings: Arc<DownloadSettings>,
        library: Arc<dyn ExtractorLibrary>,
    ) -> Self {
        Self {
            request,
            settings,
            library,
            cancel: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
        }
    }

    fn library_request(&self, cancel: CancellationToken) -> LibraryRequest {
        let mut options = self.request.options.to_library_options();
        options.proxy = self.settings.proxy().map(str::to_string);
        LibraryRequest {
            url: self.request.video.url.clone(),
            output_template: self.settings.output_path(&self.request.dest_dir),
            options,
            cancel,
        }
    }
}

#[async_trait]
impl DownloadTask for LibraryTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Library
    }

    async fn start(&self, sink: ProgressSink) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let request = self.library_request(token);
        let library = Arc::clone(&self.library);
        info!(
            "Starting {} download {} for {}",
            library.name(),
            sink.job_id(),
            request.url
        );

        sink.report(ProgressSnapshot::default().with_status(DownloadStatus::Downloading))
            .await;

        let handle = tokio::task::spawn_blocking(move || {
            let terminal = run_library(library.as_ref(), &request, &sink);
            sink.blocking_report(terminal);
        });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Cancel the engine call and wait for it to return, up to [`STOP_TIMEOUT`].
    async fn stop(&self) {
        self.cancel.lock().cancel();

        let Some(mut handle) = self.worker.lock().take() else {
            return;
        };
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!(
                "{} did not return within {:?} of cancellation",
                self.library.name(),
                STOP_TIMEOUT
            );
            let mut worker = self.worker.lock();
            if worker.is_none() {
                *worker = Some(handle);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Drive one engine call and return the terminal snapshot.
fn run_library(
    library: &dyn ExtractorLibrary,
    request: &LibraryRequest,
    sink: &ProgressSink,
) -> ProgressSnapshot {
    let cancel = &request.cancel;
    let mut progress = ProgressSnapshot::default().with_status(DownloadStatus::Downloading);
    let mut already_present = false;
    let mut saw_bytes = false;

    let mut hook = |status: HookStatus| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        match status {
            HookStatus::Downloading {
                downloaded_bytes,
                total_bytes,
                speed,
                eta,
            } => {
                progress.bytes_downloaded = downloaded_bytes;
                progress.bytes_total = total_bytes.filter(|t| *t > 0);
                progress.speed_bps = speed;
                progress.eta_secs = eta;
                saw_bytes |= downloaded_bytes > 0;
                sink.blocking_report(progress.clone());
            }
            HookStatus::Finished { filename } => {
                if filename.is_some() {
                    progress.filename = filename;
                }
            }
            HookStatus::AlreadyDownloaded { filename } => {
                already_present = true;
                if filename.is_some() {
                    progress.filename = filename;
                }
            }
        }
        ControlFlow::Continue(())
    };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        library.download(request, &mut hook)
    }));

    match outcome {
        Ok(Err(LibraryError::Aborted)) => progress.with_status(DownloadStatus::Cancelled),
        _ if cancel.is_cancelled() => progress.with_status(DownloadStatus::Cancelled),
        Ok(Ok(())) if already_present && !saw_bytes => progress.with_status(DownloadStatus::Skipped),
        Ok(Ok(())) => {
            if let Some(total) = progress.bytes_total {
                progress.bytes_downloaded = progress.bytes_downloaded.max(total);
            }
            progress.with_status(DownloadStatus::Finished)
        }
        Ok(Err(LibraryError::Failed(message))) => {
            warn!("{} download failed: {}", library.name(), message);
            progress.failed(message)
        }
        Err(_) => {
            error!("{} panicked during download", library.name());
            progress.failed(format!("{} crashed", library.name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::traits::TaskReport;
    use crate::models::{DownloadOptions, Video};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Scripted engine replaying a fixed list of hook calls.
    struct ScriptedLibrary {
        ticks: Vec<HookStatus>,
        result: fn() -> std::result::Result<(), LibraryError>,
        tick_delay: Duration,
        seen: Mutex<Vec<LibraryRequest>>,
    }

    impl ScriptedLibrary {
        fn new(ticks: Vec<HookStatus>) -> Self {
            Self {
                ticks,
                result: || Ok(()),
                tick_delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ExtractorLibrary for ScriptedLibrary {
        fn name(&self) -> &str {
            "scripted"
        }

        fn download(
            &self,
            request: &LibraryRequest,
            hook: &mut ProgressHook<'_>,
        ) -> std::result::Result<(), LibraryError> {
            self.seen.lock().push(request.clone());
            for tick in &self.ticks {
                std::thread::sleep(self.tick_delay);
                if hook(tick.clone()).is_break() {
                    return Err(LibraryError::Aborted);
                }
            }
            (self.result)()
        }
    }

    struct PanickingLibrary;

    impl ExtractorLibrary for PanickingLibrary {
        fn name(&self) -> &str {
            "panicky"
        }

        fn download(
            &self,
            _request: &LibraryRequest,
            _hook: &mut ProgressHook<'_>,
        ) -> std::result::Result<(), LibraryError> {
            panic!("engine bug")
        }
    }

    fn tick(bytes: u64) -> HookStatus {
        HookStatus::Downloading {
            downloaded_bytes: bytes,
            total_bytes: Some(100),
            speed: Some(10.0),
            eta: Some(1),
        }
    }

    fn task(library: Arc<dyn ExtractorLibrary>) -> LibraryTask {
        let settings = Arc::new(DownloadSettings {
            http_proxy: Some("http://proxy:8080".into()),
            ..Default::default()
        });
        LibraryTask::new(
            DownloadRequest::new(
                Video::new("v1", "Clip", "https://example.com/v1"),
                DownloadOptions::default(),
                "/videos",
            ),
            settings,
            library,
        )
    }

    async fn run(task: &LibraryTask) -> Vec<ProgressSnapshot> {
        let (tx, mut rx) = mpsc::channel::<TaskReport>(64);
        task.start(ProgressSink::new("job", 1, tx)).await.unwrap();

        let mut snapshots = Vec::new();
        while let Some(report) = rx.recv().await {
            let terminal = report.snapshot.status.is_terminal();
            snapshots.push(report.snapshot);
            if terminal {
                break;
            }
        }
        snapshots
    }

    #[tokio::test]
    async fn reports_ticks_then_finished() {
        let library = Arc::new(ScriptedLibrary::new(vec![
            tick(50),
            tick(100),
            HookStatus::Finished {
                filename: Some("/videos/Clip.mp4".into()),
            },
        ]));
        let task = task(library.clone());

        let snapshots = run(&task).await;
        let statuses: Vec<_> = snapshots.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::Downloading,
                DownloadStatus::Downloading,
                DownloadStatus::Downloading,
                DownloadStatus::Finished,
            ]
        );
        let last = snapshots.last().unwrap();
        assert_eq!(last.filename.as_deref(), Some("/videos/Clip.mp4"));

        let seen = library.seen.lock();
        assert_eq!(seen[0].output_template, "/videos/%(title)s.%(ext)s");
        assert_eq!(seen[0].options.proxy.as_deref(), Some("http://proxy:8080"));
        assert_eq!(seen[0].options.retries, 3);
    }

    #[tokio::test]
    async fn already_downloaded_is_skipped() {
        let library = Arc::new(ScriptedLibrary::new(vec![HookStatus::AlreadyDownloaded {
            filename: Some("/videos/Clip.mp4".into()),
        }]));
        let snapshots = run(&task(library)).await;
        assert_eq!(snapshots.last().unwrap().status, DownloadStatus::Skipped);
    }

    #[tokio::test]
    async fn engine_failure_becomes_error() {
        let mut library = ScriptedLibrary::new(vec![tick(10)]);
        library.result = || Err(LibraryError::Failed("HTTP Error 403".into()));
        let snapshots = run(&task(Arc::new(library))).await;

        let last = snapshots.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Error);
        assert_eq!(last.error.as_deref(), Some("HTTP Error 403"));
    }

    #[tokio::test]
    async fn stop_aborts_through_hook() {
        let mut library = ScriptedLibrary::new((0..200).map(tick).collect());
        library.tick_delay = Duration::from_millis(5);
        let task = task(Arc::new(library));

        let (tx, mut rx) = mpsc::channel::<TaskReport>(512);
        task.start(ProgressSink::new("job", 1, tx)).await.unwrap();
        // Wait for the first engine tick.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        task.stop().await;

        let mut last = None;
        while let Some(report) = rx.recv().await {
            last = Some(report.snapshot.status);
        }
        assert_eq!(last, Some(DownloadStatus::Cancelled));
    }

    #[tokio::test]
    async fn stop_returns_after_the_engine_call() {
        let mut library = ScriptedLibrary::new((0..50).map(tick).collect());
        library.tick_delay = Duration::from_millis(200);
        let task = task(Arc::new(library));

        let (tx, mut rx) = mpsc::channel::<TaskReport>(512);
        task.start(ProgressSink::new("job", 1, tx)).await.unwrap();
        let _ = rx.recv().await;
        task.stop().await;
        assert!(!task.is_running());

        // The terminal report is sent before the worker exits.
        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report.snapshot.status);
        }
        assert_eq!(last, Some(DownloadStatus::Cancelled));
    }

    /// Engine that never calls its hook and only watches the request token.
    struct SilentLibrary;

    impl ExtractorLibrary for SilentLibrary {
        fn name(&self) -> &str {
            "silent"
        }

        fn download(
            &self,
            request: &LibraryRequest,
            _hook: &mut ProgressHook<'_>,
        ) -> std::result::Result<(), LibraryError> {
            while !request.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(LibraryError::Aborted)
        }
    }

    #[tokio::test]
    async fn quiet_engine_sees_cancellation() {
        let task = task(Arc::new(SilentLibrary));
        let (tx, mut rx) = mpsc::channel::<TaskReport>(16);
        task.start(ProgressSink::new("job", 1, tx)).await.unwrap();
        let _ = rx.recv().await;

        tokio::time::timeout(Duration::from_secs(2), task.stop())
            .await
            .unwrap();
        assert!(!task.is_running());
        let report = rx.recv().await.unwrap();
        assert_eq!(report.snapshot.status, DownloadStatus::Cancelled);
    }

    #[tokio::test]
    async fn panicking_engine_is_contained() {
        let snapshots = run(&task(Arc::new(PanickingLibrary))).await;
        let last = snapshots.last().unwrap();
        assert_eq!(last.status, DownloadStatus::Error);
        assert_eq!(last.error.as_deref(), Some("panicky crashed"));
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let mut library = ScriptedLibrary::new((0..50).map(tick).collect());
        library.tick_delay = Duration::from_millis(5);
        let library = Arc::new(library);
        let task = task(library.clone());

        let (tx, _rx) = mpsc::channel::<TaskReport>(512);
        task.start(ProgressSink::new("job", 1, tx.clone())).await.unwrap();
        task.start(ProgressSink::new("job", 1, tx)).await.unwrap();
        task.stop().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(library.seen.lock().len(), 1);
    }
}
