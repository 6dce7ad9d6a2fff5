//! Lifecycle of one external engine process.
//!
//! A [`ProcessRunner`] owns at most one live child. Stdout and stderr are
//! piped separately and pumped by one reader task each into a shared queue;
//! a single consumer forwards the tagged lines to the caller. A supervisor
//! task waits for the child, handles stop requests and reports the final
//! [`ProcessExit`] once the output has been drained.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::STDERR_TAG;
use super::utils::OutputRecordReader;
use crate::{Error, Result};

/// Time a process gets to exit after a terminate request before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Time allowed for readers to hit end-of-stream once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const LINE_QUEUE_CAPACITY: usize = 256;

const STDERR_TAIL_LINES: usize = 20;

/// Stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

/// One record of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub origin: StreamOrigin,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            origin: StreamOrigin::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            origin: StreamOrigin::Stderr,
            text: text.into(),
        }
    }

    /// Text with stderr lines prefixed by the stderr tag, as the parser expects.
    pub fn tagged(&self) -> Cow<'_, str> {
        match self.origin {
            StreamOrigin::Stdout => Cow::Borrowed(&self.text),
            StreamOrigin::Stderr => Cow::Owned(format!("{STDERR_TAG}{}", self.text)),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// The process was ended through [`ProcessRunner::stop`].
    pub stopped: bool,
    /// Last lines written to stderr.
    pub stderr_tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        !self.stopped && self.code == Some(0)
    }
}

struct LiveProcess {
    pid: Option<u32>,
    stop: CancellationToken,
    done: CancellationToken,
}

/// Runs one engine process at a time.
pub struct ProcessRunner {
    program: String,
    current: Mutex<Option<LiveProcess>>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            current: Mutex::new(None),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the current process is still alive or its output is still draining.
    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|live| !live.done.is_cancelled())
    }

    /// Spawn the program with `args`, stopping any process started earlier.
    ///
    /// Output lines are forwarded to `sink` in per-stream order. The returned
    /// receiver resolves once the process has exited and its output has been
    /// forwarded; `sink` is dropped before that happens.
    pub async fn start(
        &self,
        args: &[String],
        sink: mpsc::Sender<OutputLine>,
    ) -> Result<oneshot::Receiver<ProcessExit>> {
        self.stop().await;

        info!("Starting {} with args: {:?}", self.program, args);

        let mut command = process_utils::tokio_command(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("Failed to spawn {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(format!("Failed to capture {} stdout", self.program)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn(format!("Failed to capture {} stderr", self.program)))?;

        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let pumps = [
            tokio::spawn(pump_stream(stdout, StreamOrigin::Stdout, line_tx.clone())),
            tokio::spawn(pump_stream(stderr, StreamOrigin::Stderr, line_tx)),
        ];
        let consumer = tokio::spawn(forward_lines(line_rx, sink));

        let pid = child.id();
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(supervise(
            child,
            pumps,
            consumer,
            stop.clone(),
            done.clone(),
            exit_tx,
        ));

        *self.current.lock() = Some(LiveProcess { pid, stop, done });
        debug!("{} started with pid {:?}", self.program, pid);

        Ok(exit_rx)
    }

    /// Stop the current process: terminate, wait [`STOP_GRACE`], then kill.
    ///
    /// Always clears the process handle. Never fails.
    pub async fn stop(&self) {
        let Some(live) = self.current.lock().take() else {
            return;
        };
        if live.done.is_cancelled() {
            return;
        }

        info!("Stopping {} (pid {:?})", self.program, live.pid);
        live.stop.cancel();

        let bound = STOP_GRACE + DRAIN_TIMEOUT + Duration::from_secs(1);
        if tokio::time::timeout(bound, live.done.cancelled())
            .await
            .is_err()
        {
            warn!(
                "{} (pid {:?}) did not wind down within {:?}",
                self.program, live.pid, bound
            );
        }
    }
}

async fn pump_stream<R>(stream: R, origin: StreamOrigin, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = OutputRecordReader::new(stream);
    loop {
        match reader.next_record().await {
            Ok(Some(text)) => {
                if tx.send(OutputLine { origin, text }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {:?}: {}", origin, e);
                break;
            }
        }
    }
}

/// Forward queued lines to the sink and keep the stderr tail.
async fn forward_lines(
    mut rx: mpsc::Receiver<OutputLine>,
    sink: mpsc::Sender<OutputLine>,
) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut sink_open = true;

    while let Some(line) = rx.recv().await {
        if line.origin == StreamOrigin::Stderr {
            debug!("engine stderr: {}", line.text);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.text.clone());
        }
        // Keep draining after the sink closes so readers never block on a full queue.
        if sink_open && sink.send(line).await.is_err() {
            sink_open = false;
        }
    }

    tail.into()
}

async fn supervise(
    mut child: Child,
    pumps: [JoinHandle<()>; 2],
    mut consumer: JoinHandle<Vec<String>>,
    stop: CancellationToken,
    done: CancellationToken,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let (code, stopped) = tokio::select! {
        status = child.wait() => (exit_code(status), false),
        _ = stop.cancelled() => (terminate(&mut child).await, true),
    };

    let stderr_tail = match tokio::time::timeout(DRAIN_TIMEOUT, &mut consumer).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            warn!("Output consumer failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            // A grandchild may still hold the pipes open.
            warn!("Process output still open after exit; abandoning readers");
            for pump in &pumps {
                pump.abort();
            }
            consumer.abort();
            Vec::new()
        }
    };

    done.cancel();
    let _ = exit_tx.send(ProcessExit {
        code,
        stopped,
        stderr_tail,
    });
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => {
            if let Some(code) = status.code().filter(|c| *c != 0) {
                warn!("Process exited with code: {}", code);
            }
            status.code()
        }
        Err(e) => {
            warn!("Error waiting for process: {}", e);
            Some(-1)
        }
    }
}

async fn terminate(child: &mut Child) -> Option<i32> {
    if process_utils::request_terminate(child).await {
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => return exit_code(status),
            Err(_) => debug!("Grace period elapsed, killing process"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill process: {}", e);
    }
    child.wait().await.ok().and_then(|status| status.code())
}
