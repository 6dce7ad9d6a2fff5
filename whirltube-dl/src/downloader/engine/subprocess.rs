//! Subprocess strategy: drive the engine binary through a [`ProcessRunner`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::parser::{ParseOutcome, ProgressEvent, engine_hook_args, parse_line};
use super::runner::{OutputLine, ProcessExit, ProcessRunner};
use super::traits::{
    DownloadRequest, DownloadStatus, DownloadTask, ProgressSink, ProgressSnapshot, TaskKind,
};
use crate::Result;
use crate::config::DownloadSettings;

const LINE_CHANNEL_CAPACITY: usize = 128;

/// Runs one job as an engine subprocess.
pub struct SubprocessTask {
    request: DownloadRequest,
    settings: Arc<DownloadSettings>,
    runner: ProcessRunner,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SubprocessTask {
    pub fn new(request: DownloadRequest, settings: Arc<DownloadSettings>) -> Self {
        let runner = ProcessRunner::new(settings.engine_program());
        Self {
            request,
            settings,
            runner,
            watcher: Mutex::new(None),
        }
    }

    /// Build the full engine argument vector.
    pub fn build_args(&self) -> Result<Vec<String>> {
        let options = self.request.options.to_cli_args()?;

        let mut args = vec![
            "-o".to_string(),
            self.settings.output_path(&self.request.dest_dir),
        ];
        if let Some(proxy) = self.settings.proxy()
            && !options.iter().any(|a| a == "--proxy")
        {
            args.extend(["--proxy".to_string(), proxy.to_string()]);
        }
        args.extend(options);
        args.push(self.request.video.url.clone());
        args.extend(engine_hook_args());
        Ok(args)
    }
}

#[async_trait]
impl DownloadTask for SubprocessTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Subprocess
    }

    async fn start(&self, sink: ProgressSink) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let args = self.build_args()?;
        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let exit_rx = self.runner.start(&args, line_tx).await?;

        info!(
            "Started subprocess download {} for {}",
            sink.job_id(),
            self.request.video.url
        );

        let program = self.runner.program().to_string();
        let dest_dir = self.request.dest_dir.clone();
        let handle = tokio::spawn(watch(line_rx, exit_rx, sink, program, dest_dir));
        *self.watcher.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.runner.stop().await;
    }

    fn is_running(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// Feed output through the parser, then report the terminal outcome once the
/// process has exited.
async fn watch(
    mut lines: mpsc::Receiver<OutputLine>,
    exit_rx: oneshot::Receiver<ProcessExit>,
    sink: ProgressSink,
    program: String,
    dest_dir: PathBuf,
) {
    let mut state = RunState::default();
    sink.report(state.progress.clone().with_status(DownloadStatus::Downloading))
        .await;

    while let Some(line) = lines.recv().await {
        if let Some(snapshot) = state.apply(parse_line(&line.tagged())) {
            sink.report(snapshot).await;
        }
    }

    let exit = exit_rx.await.unwrap_or_else(|_| {
        warn!("Process supervisor for {} went away", sink.job_id());
        ProcessExit::default()
    });
    let terminal = state.finish(&exit, &program);
    debug!(
        "Subprocess download {} in {} ended: {:?}",
        sink.job_id(),
        dest_dir.display(),
        terminal.status
    );
    sink.report(terminal).await;
}

/// What has been observed from one engine run.
#[derive(Debug, Default)]
struct RunState {
    progress: ProgressSnapshot,
    /// First fatal error the engine reported.
    error: Option<String>,
    saw_bytes: bool,
    saw_end_marker: bool,
}

impl RunState {
    /// Fold one parse result in, returning a snapshot worth reporting.
    fn apply(&mut self, outcome: ParseOutcome) -> Option<ProgressSnapshot> {
        match outcome {
            ParseOutcome::Nothing => None,
            ParseOutcome::Error(message) => {
                warn!("Engine reported error: {}", message);
                self.error.get_or_insert(message);
                None
            }
            ParseOutcome::Events(events) => {
                let mut changed = false;
                for event in events {
                    match event {
                        ProgressEvent::Downloading(payload) => {
                            let progress = &mut self.progress;
                            progress.status = DownloadStatus::Downloading;
                            progress.bytes_downloaded = payload.downloaded();
                            progress.bytes_total = payload.total();
                            progress.speed_bps = payload.speed.filter(|s| s.is_finite());
                            progress.eta_secs = payload.eta_secs();
                            self.saw_bytes |= progress.bytes_downloaded > 0;
                            changed = true;
                        }
                        ProgressEvent::AfterMove { filepath } => {
                            if filepath.is_some() {
                                self.progress.filename = filepath;
                            }
                        }
                        ProgressEvent::EndOfVideo | ProgressEvent::EndOfPlaylist => {
                            self.saw_end_marker = true;
                        }
                        ProgressEvent::PreDownload => {}
                    }
                }
                changed.then(|| self.progress.clone())
            }
        }
    }

    /// Terminal snapshot for a finished process.
    ///
    /// An end-of-item marker without a single downloaded byte is taken to
    /// mean the engine skipped an existing file. The engine never says so
    /// explicitly; this is inferred from marker ordering.
    fn finish(mut self, exit: &ProcessExit, program: &str) -> ProgressSnapshot {
        if exit.stopped {
            return self.progress.with_status(DownloadStatus::Cancelled);
        }
        if let Some(error) = self.error.take() {
            return self.progress.failed(error);
        }
        if !exit.success() {
            let mut message = match exit.code {
                Some(code) => format!("{program} exited with code {code}"),
                None => format!("{program} was terminated by a signal"),
            };
            if let Some(last) = exit.stderr_tail.last() {
                message.push_str(": ");
                message.push_str(last);
            }
            return self.progress.failed(message);
        }
        if self.saw_end_marker && !self.saw_bytes {
            return self.progress.with_status(DownloadStatus::Skipped);
        }

        if let Some(total) = self.progress.bytes_total {
            self.progress.bytes_downloaded = self.progress.bytes_downloaded.max(total);
        }
        self.progress.with_status(DownloadStatus::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::parser::MARKER;
    use crate::models::{DownloadOptions, Video};

    fn request(options: DownloadOptions) -> DownloadRequest {
        DownloadRequest::new(
            Video::new("abc", "Clip", "https://example.com/watch?v=abc"),
            options,
            "/videos",
        )
    }

    fn exit(code: Option<i32>) -> ProcessExit {
        ProcessExit {
            code,
            ..Default::default()
        }
    }

    fn downloading(bytes: u64) -> ParseOutcome {
        parse_line(&format!(
            r#"{MARKER}{{"type":"downloading","downloaded_bytes":{bytes},"total_bytes":2048,"eta":NA}}"#
        ))
    }

    fn end_of_video() -> ParseOutcome {
        parse_line(&format!(r#"{MARKER}{{"type":"end_of_video"}}"#))
    }

    #[test]
    fn args_inject_proxy_and_hooks() {
        let settings = Arc::new(DownloadSettings {
            http_proxy: Some("http://proxy:3128".into()),
            ..Default::default()
        });
        let task = SubprocessTask::new(request(DownloadOptions::default()), settings);

        let args = task.build_args().unwrap();
        assert_eq!(args[0], "-o");
        assert_eq!(args[1], "/videos/%(title)s.%(ext)s");
        assert_eq!(&args[2..4], ["--proxy", "http://proxy:3128"]);
        let url_idx = args
            .iter()
            .position(|a| a == "https://example.com/watch?v=abc")
            .unwrap();
        assert_eq!(args[url_idx + 1], "--print");
        assert!(args.iter().any(|a| a == "--progress-template"));
    }

    #[test]
    fn explicit_proxy_flag_wins() {
        let settings = Arc::new(DownloadSettings {
            http_proxy: Some("http://proxy:3128".into()),
            ..Default::default()
        });
        let options = DownloadOptions {
            extra_flags: "--proxy socks5://localhost:1080".into(),
            ..Default::default()
        };
        let task = SubprocessTask::new(request(options), settings);

        let args = task.build_args().unwrap();
        assert_eq!(args.iter().filter(|a| *a == "--proxy").count(), 1);
        assert!(args.iter().any(|a| a == "socks5://localhost:1080"));
    }

    #[test]
    fn invalid_extra_flags_fail_before_spawn() {
        let options = DownloadOptions {
            extra_flags: "'unterminated".into(),
            ..Default::default()
        };
        let task = SubprocessTask::new(request(options), Arc::new(DownloadSettings::default()));
        assert!(task.build_args().is_err());
    }

    #[test]
    fn downloading_updates_progress() {
        let mut state = RunState::default();
        let snapshot = state.apply(downloading(1024)).unwrap();
        assert_eq!(snapshot.status, DownloadStatus::Downloading);
        assert_eq!(snapshot.bytes_downloaded, 1024);
        assert_eq!(snapshot.bytes_total, Some(2048));
        assert_eq!(snapshot.eta_secs, None);
    }

    #[test]
    fn clean_exit_finishes() {
        let mut state = RunState::default();
        state.apply(downloading(1024));
        state.apply(end_of_video());
        let done = state.finish(&exit(Some(0)), "yt-dlp");
        assert_eq!(done.status, DownloadStatus::Finished);
        assert_eq!(done.bytes_downloaded, 2048);
    }

    #[test]
    fn nonzero_exit_without_error_synthesizes_one() {
        let mut state = RunState::default();
        state.apply(parse_line("stderr:WARNING: something odd"));
        let done = state.finish(&exit(Some(2)), "yt-dlp");
        assert_eq!(done.status, DownloadStatus::Error);
        assert_eq!(done.error.as_deref(), Some("yt-dlp exited with code 2"));
    }

    #[test]
    fn parsed_error_takes_precedence_over_exit_code() {
        let mut state = RunState::default();
        assert!(state.apply(parse_line("stderr:ERROR: Video unavailable")).is_none());
        state.apply(parse_line("stderr:ERROR: second error"));
        let done = state.finish(&exit(Some(1)), "yt-dlp");
        assert_eq!(done.error.as_deref(), Some("Video unavailable"));
    }

    #[test]
    fn end_marker_without_bytes_is_skipped() {
        let mut state = RunState::default();
        state.apply(parse_line(&format!(r#"{MARKER}{{"type":"pre_download"}}"#)));
        state.apply(downloading(0));
        state.apply(end_of_video());
        let done = state.finish(&exit(Some(0)), "yt-dlp");
        assert_eq!(done.status, DownloadStatus::Skipped);
    }

    #[test]
    fn no_markers_and_no_bytes_still_finishes() {
        let state = RunState::default();
        let done = state.finish(&exit(Some(0)), "yt-dlp");
        assert_eq!(done.status, DownloadStatus::Finished);
    }

    #[test]
    fn stopped_process_is_cancelled() {
        let mut state = RunState::default();
        state.apply(parse_line("ERROR: interrupted"));
        let done = state.finish(
            &ProcessExit {
                code: None,
                stopped: true,
                stderr_tail: Vec::new(),
            },
            "yt-dlp",
        );
        assert_eq!(done.status, DownloadStatus::Cancelled);
    }

    #[test]
    fn after_move_sets_filename() {
        let mut state = RunState::default();
        state.apply(parse_line(&format!(
            r#"{MARKER}{{"type":"after_move","filepath":"/videos/Clip.mp4"}}"#
        )));
        state.apply(downloading(10));
        let done = state.finish(&exit(Some(0)), "yt-dlp");
        assert_eq!(done.filename.as_deref(), Some("/videos/Clip.mp4"));
    }
}
