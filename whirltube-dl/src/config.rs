//! Download settings.
//!
//! [`DownloadSettings`] is an immutable snapshot handed to the queue at
//! construction. Changing settings means building a new snapshot and passing
//! it to `JobQueue::reconfigure`.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::fs::write_atomic;
use crate::{Error, Result};

/// Application directory name under the per-user config and data directories.
pub const APP_DIR: &str = "whirltube";

/// Output filename template used when none is configured or the configured one is unsafe.
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default engine binary, looked up on `PATH`.
pub const DEFAULT_ENGINE_PROGRAM: &str = "yt-dlp";

/// Environment variable overriding the engine binary.
pub const ENGINE_PATH_ENV: &str = "YTDLP_PATH";

/// Snapshot of all settings the download pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Destination used when a download does not name its own.
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// Custom engine binary.
    pub ytdlp_path: Option<String>,
    /// Proxy passed to the engine unless the options already carry one.
    pub http_proxy: Option<String>,
    /// Output filename template relative to the destination directory.
    pub download_template: String,
    /// Where the queue snapshot, history and logs live.
    pub data_dir: PathBuf,
    pub notifications: bool,
    pub record_history: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            ytdlp_path: None,
            http_proxy: None,
            download_template: DEFAULT_OUTPUT_TEMPLATE.to_string(),
            data_dir: default_data_dir(),
            notifications: true,
            record_history: true,
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl DownloadSettings {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("settings.json"))
    }

    /// Load settings from `path`, then apply environment overrides.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// parsed is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Self>(&raw).map_err(|e| {
                Error::config(format!("Invalid settings file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Persist settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if non_blank(self.ytdlp_path.as_deref()).is_none()
            && let Ok(path) = std::env::var(ENGINE_PATH_ENV)
            && !path.trim().is_empty()
        {
            self.ytdlp_path = Some(path.trim().to_string());
        }
    }

    /// Concurrency cap, never below one.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    /// Engine binary to spawn.
    pub fn engine_program(&self) -> &str {
        non_blank(self.ytdlp_path.as_deref()).unwrap_or(DEFAULT_ENGINE_PROGRAM)
    }

    pub fn proxy(&self) -> Option<&str> {
        non_blank(self.http_proxy.as_deref())
    }

    /// The configured output template, or the default if it is unsafe.
    pub fn output_template(&self) -> String {
        sanitize_output_template(&self.download_template)
    }

    /// Full output template for a destination directory.
    pub fn output_path(&self, dest_dir: &Path) -> String {
        dest_dir
            .join(self.output_template())
            .to_string_lossy()
            .into_owned()
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("download_queue.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("download_history.jsonl")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Validate an output filename template.
///
/// Templates that are empty, absolute, or that climb out of the destination
/// with `..` are replaced by [`DEFAULT_OUTPUT_TEMPLATE`].
pub fn sanitize_output_template(template: &str) -> String {
    let template = template.trim();
    if template.is_empty() {
        return DEFAULT_OUTPUT_TEMPLATE.to_string();
    }

    // Check both separators regardless of platform.
    let normalized = template.replace('\\', "/");
    let path = Path::new(&normalized);
    let escapes = normalized.starts_with('/')
        || template.contains('\0')
        || has_drive_prefix(template)
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });

    if escapes {
        warn!(
            "Rejecting unsafe output template {:?}, using {:?}",
            template, DEFAULT_OUTPUT_TEMPLATE
        );
        return DEFAULT_OUTPUT_TEMPLATE.to_string();
    }
    template.to_string()
}

fn has_drive_prefix(template: &str) -> bool {
    let bytes = template.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
