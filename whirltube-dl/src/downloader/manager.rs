//! Job queue implementation.
//!
//! All queue state lives in one actor task. [`JobQueue`] is a cheap,
//! cloneable handle that talks to it over a bounded mailbox with oneshot
//! replies. Running tasks report back over a second bounded channel; each
//! report carries the run number it was dispatched with, so reports from a
//! cancelled or superseded run are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::utils::ensure_output_dir;
use super::engine::{
    DownloadRequest, DownloadStatus, DownloadTask, ExtractorLibrary, JobId, LibraryTask,
    ProgressSink, ProgressSnapshot, SubprocessTask, TaskKind, TaskReport,
};
use super::persistence::{QueueEntry, QueueStore, load_queue};
use crate::config::DownloadSettings;
use crate::history::{DownloadHistory, HistoryRecord};
use crate::models::{DownloadOptions, Video};
use crate::notify::{Notification, Notifier};
use crate::{Error, Result};

/// Capacity of the command mailbox.
const MAILBOX_CAPACITY: usize = 256;

/// Capacity of the channel carrying task reports into the actor.
const REPORT_CAPACITY: usize = 256;

/// Capacity of the job event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    /// Completed, including downloads skipped because the file existed.
    Finished,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    /// Whether a retry may re-enqueue a job in this state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Cancelled)
    }

    fn from_terminal(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Error => Self::Error,
            DownloadStatus::Cancelled => Self::Cancelled,
            _ => Self::Finished,
        }
    }
}

/// A download job as seen from outside the queue.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub video: Video,
    pub options: DownloadOptions,
    pub dest_dir: PathBuf,
    pub state: JobState,
    pub progress: ProgressSnapshot,
    /// Strategy of the current or most recent run.
    pub kind: Option<TaskKind>,
    pub created_at: DateTime<Utc>,
}

/// Events broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job entered the queue, on submission or retry.
    Queued { job_id: JobId, title: String },
    /// A job was dispatched to a strategy.
    Started { job_id: JobId, kind: TaskKind },
    Progress {
        job_id: JobId,
        progress: ProgressSnapshot,
    },
    /// A run ended. Sent exactly once per run.
    Terminal {
        job_id: JobId,
        state: JobState,
        progress: ProgressSnapshot,
    },
    Removed { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Terminal { job_id, .. }
            | Self::Removed { job_id } => job_id,
        }
    }
}

/// Creates the task that runs one job.
pub trait TaskFactory: Send + Sync {
    fn create(
        &self,
        request: DownloadRequest,
        settings: Arc<DownloadSettings>,
    ) -> Arc<dyn DownloadTask>;
}

/// Picks the library strategy for plain options when a library is
/// registered, and the subprocess strategy otherwise.
#[derive(Clone, Default)]
pub struct EngineTaskFactory {
    library: Option<Arc<dyn ExtractorLibrary>>,
}

impl EngineTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library(library: Arc<dyn ExtractorLibrary>) -> Self {
        Self {
            library: Some(library),
        }
    }
}

impl TaskFactory for EngineTaskFactory {
    fn create(
        &self,
        request: DownloadRequest,
        settings: Arc<DownloadSettings>,
    ) -> Arc<dyn DownloadTask> {
        match &self.library {
            Some(library) if !request.options.is_advanced() => {
                Arc::new(LibraryTask::new(request, settings, Arc::clone(library)))
            }
            _ => Arc::new(SubprocessTask::new(request, settings)),
        }
    }
}

enum Command {
    Submit {
        video: Video,
        options: DownloadOptions,
        dest_dir: PathBuf,
        reply: oneshot::Sender<JobId>,
    },
    SetMaxConcurrent(usize),
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Retry {
        job_id: JobId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Remove {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelAll(oneshot::Sender<usize>),
    ClearFinished(oneshot::Sender<usize>),
    PersistQueue(oneshot::Sender<()>),
    Reconfigure(Arc<DownloadSettings>),
    Jobs(oneshot::Sender<Vec<Job>>),
    Job {
        job_id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the download queue.
#[derive(Clone)]
pub struct JobQueue {
    commands: mpsc::Sender<Command>,
    settings: watch::Receiver<Arc<DownloadSettings>>,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    /// Start a queue using the engine strategies.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(settings: DownloadSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_factory(settings, Arc::new(EngineTaskFactory::new()), notifier)
    }

    /// Start a queue whose tasks come from `factory`.
    pub fn with_factory(
        settings: DownloadSettings,
        factory: Arc<dyn TaskFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let settings = Arc::new(settings);
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (report_tx, report_rx) = mpsc::channel(REPORT_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (settings_tx, settings_rx) = watch::channel(Arc::clone(&settings));

        let actor = QueueActor {
            store: QueueStore::spawn(settings.queue_path()),
            cap: settings.max_concurrent(),
            settings,
            settings_tx,
            factory,
            notifier,
            jobs: HashMap::new(),
            order: Vec::new(),
            pending: VecDeque::new(),
            live_runs: HashSet::new(),
            next_run: 0,
            report_tx,
            events: event_tx.clone(),
        };
        tokio::spawn(actor.run(command_rx, report_rx));

        Self {
            commands: command_tx,
            settings: settings_rx,
            events: event_tx,
        }
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<DownloadSettings> {
        Arc::clone(&self.settings.borrow())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::QueueClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Submit a download.
    ///
    /// The destination is `options.target_dir` or the configured download
    /// directory. It is created first; if that fails no job is created.
    pub async fn start_download(&self, video: Video, options: DownloadOptions) -> Result<JobId> {
        let dest_dir = options
            .target_dir
            .clone()
            .unwrap_or_else(|| self.settings().download_dir.clone());
        ensure_output_dir(&dest_dir).await?;

        self.request(|reply| Command::Submit {
            video,
            options,
            dest_dir,
            reply,
        })
        .await
    }

    /// Change the concurrency cap. Values below one are raised to one.
    pub async fn set_max_concurrent(&self, max: usize) -> Result<()> {
        self.send(Command::SetMaxConcurrent(max)).await
    }

    /// Cancel a queued or running job. Terminal jobs are left alone.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Cancel { job_id, reply })
            .await?
    }

    /// Re-enqueue a failed or cancelled job.
    ///
    /// Returns `false` when the job is in any other state.
    pub async fn retry(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Retry { job_id, reply }).await?
    }

    /// Cancel a job if needed, then forget it.
    pub async fn remove(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Remove { job_id, reply })
            .await?
    }

    /// Cancel every queued and running job. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> Result<usize> {
        self.request(Command::CancelAll).await
    }

    /// Remove every job in a terminal state. Returns how many were removed.
    pub async fn clear_finished(&self) -> Result<usize> {
        self.request(Command::ClearFinished).await
    }

    /// Write the queued jobs to the snapshot file and wait for the write.
    pub async fn persist_queue(&self) -> Result<()> {
        self.request(Command::PersistQueue).await
    }

    /// Re-submit the jobs saved in the snapshot file.
    ///
    /// An unreadable snapshot and entries whose destination cannot be
    /// created are logged and skipped.
    pub async fn restore_queued(&self) -> Result<Vec<JobId>> {
        let path = self.settings().queue_path();
        let entries = match load_queue(path.clone()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Not restoring queue from {}: {}", path.display(), e);
                return Ok(Vec::new());
            }
        };

        let mut restored = Vec::with_capacity(entries.len());
        for entry in entries {
            let title = entry.title.clone();
            let (video, options) = entry.into_submission();
            match self.start_download(video, options).await {
                Ok(job_id) => restored.push(job_id),
                Err(Error::QueueClosed) => return Err(Error::QueueClosed),
                Err(e) => warn!("Skipping queued download {:?}: {}", title, e),
            }
        }
        info!("Restored {} queued downloads", restored.len());
        Ok(restored)
    }

    /// Replace the settings snapshot. The cap follows the new settings.
    pub async fn reconfigure(&self, settings: DownloadSettings) -> Result<()> {
        self.send(Command::Reconfigure(Arc::new(settings))).await
    }

    /// All jobs in submission order.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.request(Command::Jobs).await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Job { job_id, reply }).await
    }

    /// Persist the queue, stop running jobs and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct JobEntry {
    job: Job,
    /// Run number of the current or last dispatch, zero if never started.
    run: u64,
    task: Option<Arc<dyn DownloadTask>>,
    cancel: CancellationToken,
}

struct QueueActor {
    settings: Arc<DownloadSettings>,
    settings_tx: watch::Sender<Arc<DownloadSettings>>,
    factory: Arc<dyn TaskFactory>,
    notifier: Arc<dyn Notifier>,
    store: QueueStore,
    jobs: HashMap<JobId, JobEntry>,
    /// Submission order.
    order: Vec<JobId>,
    /// Queued jobs in dispatch order.
    pending: VecDeque<JobId>,
    /// Runs holding a concurrency slot. A cancelled run keeps its slot
    /// until its task has stopped.
    live_runs: HashSet<u64>,
    cap: usize,
    next_run: u64,
    report_tx: mpsc::Sender<TaskReport>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<TaskReport>,
    ) {
        info!("Download queue started (max {} concurrent)", self.cap);
        loop {
            tokio::select! {
                Some(report) = reports.recv() => self.on_report(report),
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) = self.handle(command) {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                    None => {
                        debug!("All queue handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        info!("Download queue stopped");
    }

    /// Apply one command. Breaks with the reply channel on shutdown.
    fn handle(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Submit {
                video,
                options,
                dest_dir,
                reply,
            } => {
                let job_id = self.submit(video, options, dest_dir);
                let _ = reply.send(job_id);
            }
            Command::SetMaxConcurrent(max) => {
                self.cap = max.max(1);
                info!("Max concurrent downloads set to {}", self.cap);
                self.dispatch();
            }
            Command::Cancel { job_id, reply } => {
                let result = self.require(&job_id).map(|_| {
                    self.cancel(&job_id);
                });
                let _ = reply.send(result);
            }
            Command::Retry { job_id, reply } => {
                let result = self.require(&job_id).map(|_| self.retry(&job_id));
                let _ = reply.send(result);
            }
            Command::Remove { job_id, reply } => {
                let result = self.require(&job_id).map(|_| self.remove(&job_id));
                let _ = reply.send(result);
            }
            Command::CancelAll(reply) => {
                let ids = self.order.clone();
                let cancelled = ids.iter().filter(|id| self.cancel(id)).count();
                let _ = reply.send(cancelled);
            }
            Command::ClearFinished(reply) => {
                let finished: Vec<JobId> = self
                    .order
                    .iter()
                    .filter(|id| self.jobs.get(*id).is_some_and(|e| e.job.state.is_terminal()))
                    .cloned()
                    .collect();
                for job_id in &finished {
                    self.remove(job_id);
                }
                let _ = reply.send(finished.len());
            }
            Command::PersistQueue(reply) => {
                self.persist();
                let store = self.store.clone();
                tokio::spawn(async move {
                    store.flush().await;
                    let _ = reply.send(());
                });
            }
            Command::Reconfigure(settings) => self.reconfigure(settings),
            Command::Jobs(reply) => {
                let jobs = self
                    .order
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .map(|entry| entry.job.clone())
                    .collect();
                let _ = reply.send(jobs);
            }
            Command::Job { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(|e| e.job.clone()));
            }
            Command::Shutdown(reply) => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn require(&self, job_id: &str) -> Result<()> {
        if self.jobs.contains_key(job_id) {
            Ok(())
        } else {
            Err(Error::not_found("job", job_id))
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn submit(&mut self, video: Video, options: DownloadOptions, dest_dir: PathBuf) -> JobId {
        let job_id = uuid::Uuid::new_v4().to_string();
        info!("Queued download {} ({})", job_id, video.title);

        let title = video.title.clone();
        let job = Job {
            id: job_id.clone(),
            video,
            options,
            dest_dir,
            state: JobState::Queued,
            progress: ProgressSnapshot::default(),
            kind: None,
            created_at: Utc::now(),
        };
        self.jobs.insert(
            job_id.clone(),
            JobEntry {
                job,
                run: 0,
                task: None,
                cancel: CancellationToken::new(),
            },
        );
        self.order.push(job_id.clone());
        self.pending.push_back(job_id.clone());
        self.emit(JobEvent::Queued {
            job_id: job_id.clone(),
            title,
        });

        self.persist();
        self.dispatch();
        job_id
    }

    /// Start queued jobs while capacity allows.
    fn dispatch(&mut self) {
        let mut dispatched = false;
        while self.live_runs.len() < self.cap {
            let Some(job_id) = self.pending.pop_front() else {
                break;
            };
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if entry.job.state != JobState::Queued {
                continue;
            }

            self.next_run += 1;
            let run = self.next_run;
            let request = DownloadRequest::new(
                entry.job.video.clone(),
                entry.job.options.clone(),
                entry.job.dest_dir.clone(),
            );
            let task = self.factory.create(request, Arc::clone(&self.settings));
            let kind = task.kind();
            let cancel = CancellationToken::new();

            entry.run = run;
            entry.task = Some(Arc::clone(&task));
            entry.cancel = cancel.clone();
            entry.job.state = JobState::Running;
            entry.job.kind = Some(kind);
            entry.job.progress = ProgressSnapshot::default();
            self.live_runs.insert(run);
            dispatched = true;

            info!("Starting download {} via {} (run {})", job_id, kind, run);
            self.emit(JobEvent::Started {
                job_id: job_id.clone(),
                kind,
            });

            let sink = ProgressSink::new(job_id.clone(), run, self.report_tx.clone());
            tokio::spawn(start_task(
                task,
                sink,
                cancel,
                job_id,
                run,
                self.report_tx.clone(),
            ));
        }

        if dispatched {
            self.persist();
        }
    }

    fn on_report(&mut self, report: TaskReport) {
        let terminal = report.snapshot.status.is_terminal();
        let released = terminal && self.live_runs.remove(&report.run);

        let current = self
            .jobs
            .get_mut(&report.job_id)
            .filter(|e| e.run == report.run && e.job.state == JobState::Running);

        match current {
            Some(entry) if terminal => {
                let state = JobState::from_terminal(report.snapshot.status);
                entry.job.state = state;
                entry.job.progress = report.snapshot.clone();
                entry.task = None;

                match state {
                    JobState::Error => error!(
                        "Download {} failed: {}",
                        report.job_id,
                        report.snapshot.error.as_deref().unwrap_or("unknown error")
                    ),
                    _ => info!(
                        "Download {} ended: {:?}",
                        report.job_id, report.snapshot.status
                    ),
                }

                let job = entry.job.clone();
                self.emit(JobEvent::Terminal {
                    job_id: report.job_id,
                    state,
                    progress: report.snapshot,
                });
                self.after_terminal(&job);
            }
            Some(entry) => {
                entry.job.progress = report.snapshot.clone();
                self.emit(JobEvent::Progress {
                    job_id: report.job_id,
                    progress: report.snapshot,
                });
            }
            None => debug!(
                "Dropping report for {} from stale run {}",
                report.job_id, report.run
            ),
        }

        if released {
            self.persist();
            self.dispatch();
        }
    }

    /// Cancel a queued or running job. Returns whether anything changed.
    fn cancel(&mut self, job_id: &str) -> bool {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return false;
        };

        match entry.job.state {
            JobState::Queued => {
                self.pending.retain(|id| id != job_id);
                entry.job.state = JobState::Cancelled;
                entry.job.progress = entry
                    .job
                    .progress
                    .clone()
                    .with_status(DownloadStatus::Cancelled);
                info!("Cancelled queued download {}", job_id);

                let progress = entry.job.progress.clone();
                self.emit(JobEvent::Terminal {
                    job_id: job_id.to_string(),
                    state: JobState::Cancelled,
                    progress,
                });
                self.persist();
                true
            }
            JobState::Running => {
                entry.job.state = JobState::Cancelled;
                entry.job.progress = entry
                    .job
                    .progress
                    .clone()
                    .with_status(DownloadStatus::Cancelled);
                entry.cancel.cancel();
                let run = entry.run;
                let task = entry.task.take();
                let progress = entry.job.progress.clone();
                info!("Cancelling running download {} (run {})", job_id, run);

                self.emit(JobEvent::Terminal {
                    job_id: job_id.to_string(),
                    state: JobState::Cancelled,
                    progress,
                });

                let report_tx = self.report_tx.clone();
                let job_id = job_id.to_string();
                tokio::spawn(async move {
                    if let Some(task) = task {
                        task.stop().await;
                    }
                    // Frees the slot even if the task never reports.
                    let _ = report_tx
                        .send(TaskReport {
                            job_id,
                            run,
                            snapshot: ProgressSnapshot::default()
                                .with_status(DownloadStatus::Cancelled),
                        })
                        .await;
                });
                true
            }
            _ => false,
        }
    }

    fn retry(&mut self, job_id: &str) -> bool {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if !entry.job.state.is_retryable() {
            debug!("Ignoring retry of {} in state {:?}", job_id, entry.job.state);
            return false;
        }

        entry.job.state = JobState::Queued;
        entry.job.progress = ProgressSnapshot::default();
        let title = entry.job.video.title.clone();
        self.pending.push_back(job_id.to_string());
        info!("Retrying download {}", job_id);

        self.emit(JobEvent::Queued {
            job_id: job_id.to_string(),
            title,
        });
        self.persist();
        self.dispatch();
        true
    }

    fn remove(&mut self, job_id: &str) {
        self.cancel(job_id);
        if self.jobs.remove(job_id).is_some() {
            self.order.retain(|id| id != job_id);
            debug!("Removed download {}", job_id);
            self.emit(JobEvent::Removed {
                job_id: job_id.to_string(),
            });
        }
    }

    fn reconfigure(&mut self, settings: Arc<DownloadSettings>) {
        if settings.queue_path() != self.settings.queue_path() {
            self.store = QueueStore::spawn(settings.queue_path());
            info!("Queue snapshot moved to {}", self.store.path().display());
        }
        self.cap = settings.max_concurrent();
        self.settings = Arc::clone(&settings);
        self.settings_tx.send_replace(settings);
        info!("Download settings updated (max {} concurrent)", self.cap);
        self.persist();
        self.dispatch();
    }

    /// Queue a snapshot of the jobs that have not started.
    fn persist(&self) {
        let entries = self
            .pending
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|entry| entry.job.state == JobState::Queued)
            .map(|entry| {
                QueueEntry::new(
                    entry.job.video.clone(),
                    entry.job.options.clone(),
                    entry.job.dest_dir.clone(),
                )
            })
            .collect();
        self.store.save(entries);
    }

    /// History and notification for a finished run, off the actor loop.
    fn after_terminal(&self, job: &Job) {
        if job.progress.status == DownloadStatus::Finished && self.settings.record_history {
            let history = DownloadHistory::new(self.settings.history_path());
            let record = HistoryRecord::new(&job.video, &job.dest_dir, job.progress.filename.clone());
            tokio::task::spawn_blocking(move || {
                if let Err(e) = history.append(&record) {
                    warn!(
                        "Failed to record download history in {}: {}",
                        history.path().display(),
                        e
                    );
                }
            });
        }

        if self.settings.notifications
            && let Some(notification) = Notification::for_outcome(&job.video.title, &job.progress)
        {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.send(&notification).await {
                    warn!("{} notification failed: {}", notifier.channel_type(), e);
                }
            });
        }
    }

    async fn shutdown(&mut self) {
        self.persist();
        self.store.flush().await;

        let mut stops = JoinSet::new();
        let running: Vec<JobId> = self
            .order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .is_some_and(|e| e.job.state == JobState::Running)
            })
            .cloned()
            .collect();

        for job_id in running {
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            entry.job.state = JobState::Cancelled;
            entry.job.progress = entry
                .job
                .progress
                .clone()
                .with_status(DownloadStatus::Cancelled);
            entry.cancel.cancel();
            let progress = entry.job.progress.clone();
            if let Some(task) = entry.task.take() {
                stops.spawn(async move { task.stop().await });
            }
            self.emit(JobEvent::Terminal {
                job_id,
                state: JobState::Cancelled,
                progress,
            });
        }

        if !stops.is_empty() {
            info!("Stopping {} running downloads", stops.len());
        }
        while stops.join_next().await.is_some() {}
    }
}

/// Start a task off the actor loop.
///
/// A start failure becomes the run's terminal report. A cancel that lands
/// while the task is still starting stops it once it is up.
async fn start_task(
    task: Arc<dyn DownloadTask>,
    sink: ProgressSink,
    cancel: CancellationToken,
    job_id: JobId,
    run: u64,
    report_tx: mpsc::Sender<TaskReport>,
) {
    if cancel.is_cancelled() {
        return;
    }
    match task.start(sink).await {
        Ok(()) => {
            if cancel.is_cancelled() {
                task.stop().await;
            }
        }
        Err(e) => {
            error!("Failed to start download {}: {}", job_id, e);
            let _ = report_tx
                .send(TaskReport {
                    job_id,
                    run,
                    snapshot: ProgressSnapshot::default().failed(e.to_string()),
                })
                .await;
        }
    }
}
