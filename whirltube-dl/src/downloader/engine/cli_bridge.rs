//! [`ExtractorLibrary`] backed by a blocking engine process.
//!
//! Used when no in-process engine is linked. It speaks the same marker
//! protocol as the subprocess strategy but runs synchronously on the calling
//! thread, translating marker lines into hook calls.

use std::io::{BufRead, BufReader, Read};
use std::ops::ControlFlow;
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::library::{ExtractorLibrary, HookStatus, LibraryError, LibraryRequest, ProgressHook};
use super::parser::{ParseOutcome, ProgressEvent, STDERR_TAG, engine_hook_args, parse_line};
use super::runner::STOP_GRACE;

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Runs the engine binary and adapts its output to hook calls.
#[derive(Debug, Clone)]
pub struct CliBridge {
    program: String,
}

impl CliBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Engine arguments for a library request.
    pub fn build_args(request: &LibraryRequest) -> Vec<String> {
        let options = &request.options;
        let mut args = vec!["-o".to_string(), request.output_template.clone()];

        if let Some(format) = &options.format {
            args.extend(["-f".to_string(), format.clone()]);
        }
        if let Some(sort) = &options.format_sort {
            args.extend(["-S".to_string(), sort.clone()]);
        }
        if options.write_subtitles {
            args.push("--write-subs".to_string());
            if !options.subtitle_langs.is_empty() {
                args.extend(["--sub-langs".to_string(), options.subtitle_langs.join(",")]);
            }
            if options.write_auto_subtitles {
                args.push("--write-auto-subs".to_string());
            }
            if let Some(format) = &options.subtitle_format {
                args.extend(["--sub-format".to_string(), format.clone()]);
            }
        }
        args.extend([
            "--merge-output-format".to_string(),
            options.merge_output_format.clone(),
            "--retries".to_string(),
            options.retries.to_string(),
            "--fragment-retries".to_string(),
            options.fragment_retries.to_string(),
        ]);
        if let Some(proxy) = &options.proxy {
            args.extend(["--proxy".to_string(), proxy.clone()]);
        }

        args.push(request.url.clone());
        args.extend(engine_hook_args());
        args
    }

    /// Ask the child to exit, then kill it if it lingers.
    fn abort(&self, child: &mut Child) {
        if process_utils::request_terminate_std(child) {
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                thread::sleep(EXIT_POLL);
            }
            warn!("{} did not exit after SIGTERM, killing", self.program);
        }
        if let Err(e) = child.kill() {
            debug!("Failed to kill {}: {}", self.program, e);
        }
        let _ = child.wait();
    }
}

/// Path named by the engine's "already downloaded" notice.
fn already_downloaded(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("[download] ")?
        .strip_suffix(" has already been downloaded")
}

/// Read newline-separated records, replacing invalid UTF-8.
fn records<R: Read>(reader: R) -> impl Iterator<Item = String> {
    BufReader::new(reader)
        .split(b'\n')
        .map_while(std::result::Result::ok)
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string()
        })
}

impl ExtractorLibrary for CliBridge {
    fn name(&self) -> &str {
        &self.program
    }

    fn download(
        &self,
        request: &LibraryRequest,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), LibraryError> {
        let mut child = process_utils::std_command(&self.program)
            .args(Self::build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LibraryError::Failed(format!("Failed to spawn {}: {}", self.program, e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.abort(&mut child);
            return Err(LibraryError::Failed("engine pipes unavailable".to_string()));
        };

        // Drained on its own thread so a chatty stderr cannot block stdout.
        let stderr_reader = thread::spawn(move || {
            let mut first_error = None;
            let mut last_line = None;
            for line in records(stderr) {
                if let ParseOutcome::Error(message) = parse_line(&format!("{STDERR_TAG}{line}")) {
                    first_error.get_or_insert(message);
                }
                if !line.trim().is_empty() {
                    last_line = Some(line);
                }
            }
            (first_error, last_line)
        });

        // Lines arrive through a channel so the token is polled while the engine is quiet.
        let (line_tx, line_rx) = mpsc::channel();
        thread::spawn(move || {
            for line in records(stdout) {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut first_error = None;
        loop {
            if request.cancel.is_cancelled() {
                debug!("{} cancelled between progress lines", self.program);
                self.abort(&mut child);
                return Err(LibraryError::Aborted);
            }
            let line = match line_rx.recv_timeout(EXIT_POLL) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let mut flow = ControlFlow::Continue(());
            if let Some(path) = already_downloaded(&line) {
                flow = hook(HookStatus::AlreadyDownloaded {
                    filename: Some(path.to_string()),
                });
            }
            match parse_line(&line) {
                ParseOutcome::Events(events) => {
                    for event in events {
                        let status = match event {
                            ProgressEvent::Downloading(payload) => HookStatus::Downloading {
                                downloaded_bytes: payload.downloaded(),
                                total_bytes: payload.total(),
                                speed: payload.speed.filter(|s| s.is_finite()),
                                eta: payload.eta_secs(),
                            },
                            ProgressEvent::AfterMove { filepath } => {
                                HookStatus::Finished { filename: filepath }
                            }
                            _ => continue,
                        };
                        if flow.is_continue() {
                            flow = hook(status);
                        }
                    }
                }
                ParseOutcome::Error(message) => {
                    first_error.get_or_insert(message);
                }
                ParseOutcome::Nothing => {}
            }

            if flow.is_break() {
                self.abort(&mut child);
                return Err(LibraryError::Aborted);
            }
        }

        let status = child
            .wait()
            .map_err(|e| LibraryError::Failed(format!("Failed to wait for {}: {}", self.program, e)))?;
        let (stderr_error, last_stderr) = stderr_reader.join().unwrap_or_default();

        if let Some(message) = first_error.or(stderr_error) {
            return Err(LibraryError::Failed(message));
        }
        if !status.success() {
            let mut message = match status.code() {
                Some(code) => format!("{} exited with code {}", self.program, code),
                None => format!("{} was terminated by a signal", self.program),
            };
            if let Some(last) = last_stderr {
                message.push_str(": ");
                message.push_str(&last);
            }
            return Err(LibraryError::Failed(message));
        }
        Ok(())
    }
}
