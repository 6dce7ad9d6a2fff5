use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use whirltube_dl::config::DownloadSettings;
use whirltube_dl::downloader::{CliBridge, EngineTaskFactory, JobEvent, JobId, JobQueue};
use whirltube_dl::logging::{self, LOG_RETENTION_DAYS};
use whirltube_dl::models::{DownloadOptions, QualityMode, Video};
use whirltube_dl::notify::{DesktopNotifier, LogNotifier, Notifier};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download
    urls: Vec<String>,

    /// Destination directory (defaults to the configured download directory)
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(short = 'j', long)]
    max_concurrent: Option<usize>,

    /// Settings file
    #[arg(long, env = "WHIRLTUBE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Re-submit downloads left queued by a previous run
    #[arg(long)]
    restore: bool,

    /// Log directory (defaults to `<data_dir>/logs`)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run plain downloads through the blocking library bridge
    #[arg(long)]
    library: bool,

    /// Format selector passed to the engine instead of the best available
    #[arg(short, long)]
    format: Option<String>,

    /// Extra engine flags, shell-quoted
    #[arg(long, allow_hyphen_values = true)]
    extra_flags: Option<String>,
}

impl Args {
    fn options(&self) -> DownloadOptions {
        let mut options = DownloadOptions::default();
        if let Some(format) = &self.format {
            options.quality_mode = QualityMode::Custom;
            options.custom_format = Some(format.clone());
        }
        if let Some(flags) = &self.extra_flags {
            options.extra_flags = flags.clone();
        }
        options
    }
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::Queued { job_id, title } => println!("[{}] queued {}", short_id(job_id), title),
        JobEvent::Started { job_id, kind } => println!("[{}] started ({})", short_id(job_id), kind),
        JobEvent::Progress { job_id, progress } => {
            println!(
                "[{}] {} {}",
                short_id(job_id),
                progress.progress_text(),
                progress.status_text()
            )
        }
        JobEvent::Terminal {
            job_id, progress, ..
        } => println!("[{}] {}", short_id(job_id), progress.status_text()),
        JobEvent::Removed { job_id } => println!("[{}] removed", short_id(job_id)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = match args.settings.clone().or_else(DownloadSettings::default_path) {
        Some(path) => DownloadSettings::load(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => DownloadSettings::default(),
    };
    if let Some(dest) = &args.dest {
        settings.download_dir = dest.clone();
    }
    if let Some(max) = args.max_concurrent {
        settings.max_concurrent_downloads = max;
    }

    let log_dir = args.log_dir.clone().unwrap_or_else(|| settings.log_dir());
    let _guard = logging::init_logging(&log_dir)?;
    if let Err(e) = logging::cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
        warn!("Log cleanup failed: {}", e);
    }

    let factory = if args.library {
        EngineTaskFactory::with_library(Arc::new(CliBridge::new(settings.engine_program())))
    } else {
        EngineTaskFactory::new()
    };
    let notifier: Arc<dyn Notifier> = if settings.notifications {
        Arc::new(DesktopNotifier::default())
    } else {
        Arc::new(LogNotifier)
    };

    let queue = JobQueue::with_factory(settings, Arc::new(factory), notifier);
    let mut events = queue.subscribe();

    let mut pending: HashSet<JobId> = HashSet::new();
    if args.restore {
        pending.extend(queue.restore_queued().await?);
    }

    let options = args.options();
    for url in &args.urls {
        let video = Video::new(url.clone(), url.clone(), url.clone());
        match queue.start_download(video, options.clone()).await {
            Ok(job_id) => {
                pending.insert(job_id);
            }
            Err(e) => error!("Cannot queue {}: {}", url, e),
        }
    }

    if pending.is_empty() {
        info!("Nothing to download");
        queue.shutdown().await?;
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if let JobEvent::Terminal { job_id, .. } = &event {
                        pending.remove(job_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} queue events", skipped);
                    for job in queue.jobs().await? {
                        if job.state.is_terminal() {
                            pending.remove(&job.id);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, saving queued downloads");
                break;
            }
        }
        if pending.is_empty() {
            break;
        }
    }

    queue.shutdown().await?;
    Ok(())
}
