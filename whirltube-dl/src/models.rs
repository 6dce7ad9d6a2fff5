//! Domain models submitted to the download queue.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::downloader::engine::LibraryOptions;
use crate::{Error, Result};

/// Format selector used for the "highest" quality mode.
pub const BEST_FORMAT: &str = "bv*+ba/b";

/// A media item as returned by the browse layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub thumb_url: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub view_count: Option<u64>,
    /// Upload date as `YYYYMMDD`.
    #[serde(default)]
    pub upload_date: Option<String>,
}

fn default_kind() -> String {
    "video".to_string()
}

impl Video {
    /// Create a plain video entry with only the required fields set.
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            channel: None,
            duration: None,
            thumb_url: None,
            kind: default_kind(),
            view_count: None,
            upload_date: None,
        }
    }
}

/// Quality selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    #[default]
    Highest,
    Lowest,
    Custom,
}

/// Per-download options chosen by the user.
///
/// Anything the in-process library seam cannot express makes the options
/// "advanced" (see [`DownloadOptions::is_advanced`]) and routes the job to
/// the subprocess strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    // quality
    pub quality_mode: QualityMode,
    pub custom_format: Option<String>,
    /// Format sort string (`-S`).
    pub sort_string: String,

    // subtitles
    pub write_subs: bool,
    /// Comma-separated language list, e.g. `en,es`.
    pub subs_langs: String,
    pub write_auto_subs: bool,
    pub subs_format: String,

    // sponsor segments
    pub sb_mark: String,
    pub sb_remove: String,

    // embedding
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub write_thumbnail: bool,

    // cookies
    pub use_cookies: bool,
    pub cookies_browser: String,
    pub cookies_keyring: String,
    pub cookies_profile: String,
    pub cookies_container: String,

    // network
    /// Rate limit such as `4M`.
    pub limit_rate: String,
    /// Concurrent fragment downloads (`-N`), 0 leaves the engine default.
    pub concurrent_fragments: u32,
    pub impersonate: String,

    /// Raw engine flags, shell-quoted.
    pub extra_flags: String,
    /// Destination override. Stored separately when the queue is persisted.
    #[serde(skip_serializing)]
    pub target_dir: Option<PathBuf>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            quality_mode: QualityMode::Highest,
            custom_format: None,
            sort_string: String::new(),
            write_subs: false,
            subs_langs: String::new(),
            write_auto_subs: false,
            subs_format: "vtt".to_string(),
            sb_mark: String::new(),
            sb_remove: String::new(),
            embed_metadata: false,
            embed_thumbnail: false,
            write_thumbnail: false,
            use_cookies: false,
            cookies_browser: String::new(),
            cookies_keyring: String::new(),
            cookies_profile: String::new(),
            cookies_container: String::new(),
            limit_rate: String::new(),
            concurrent_fragments: 0,
            impersonate: String::new(),
            extra_flags: String::new(),
            target_dir: None,
        }
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

impl DownloadOptions {
    /// Whether these options need features only the CLI exposes.
    pub fn is_advanced(&self) -> bool {
        [
            &self.extra_flags,
            &self.sort_string,
            &self.sb_mark,
            &self.sb_remove,
            &self.limit_rate,
            &self.impersonate,
        ]
        .iter()
        .any(|s| non_blank(s).is_some())
            || self.embed_metadata
            || self.embed_thumbnail
            || self.write_thumbnail
            || self.concurrent_fragments > 0
            || self.cookie_source().is_some()
    }

    /// Resolved format selector, if the quality mode selects one.
    pub fn format(&self) -> Option<&str> {
        match self.quality_mode {
            QualityMode::Highest => Some(BEST_FORMAT),
            QualityMode::Lowest => Some("worst"),
            QualityMode::Custom => self.custom_format.as_deref().and_then(non_blank),
        }
    }

    /// Browser cookie source in the engine's
    /// `BROWSER[+KEYRING][:PROFILE[::CONTAINER]]` syntax.
    pub fn cookie_source(&self) -> Option<String> {
        if !self.use_cookies {
            return None;
        }
        let mut source = non_blank(&self.cookies_browser)?.to_string();
        if let Some(keyring) = non_blank(&self.cookies_keyring) {
            source.push('+');
            source.push_str(keyring);
        }
        let profile = non_blank(&self.cookies_profile);
        let container = non_blank(&self.cookies_container);
        if profile.is_some() || container.is_some() {
            source.push(':');
            source.push_str(profile.unwrap_or_default());
            if let Some(container) = container {
                source.push_str("::");
                source.push_str(container);
            }
        }
        Some(source)
    }

    /// Build the full engine argument list for every selected option.
    ///
    /// Fails with a validation error if `extra_flags` is not valid shell syntax.
    pub fn to_cli_args(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: Option<&str>| {
            args.push(flag.to_string());
            if let Some(value) = value {
                args.push(value.to_string());
            }
        };

        if let Some(format) = self.format() {
            push("-f", Some(format));
        }
        if let Some(sort) = non_blank(&self.sort_string) {
            push("-S", Some(sort));
        }

        if self.write_subs {
            push("--write-subs", None);
        }
        if self.write_auto_subs {
            push("--write-auto-subs", None);
        }
        if let Some(langs) = non_blank(&self.subs_langs) {
            push("--sub-langs", Some(langs));
        }
        if let Some(format) = non_blank(&self.subs_format) {
            push("--sub-format", Some(format));
        }

        if let Some(mark) = non_blank(&self.sb_mark) {
            push("--sponsorblock-mark", Some(mark));
        }
        if let Some(remove) = non_blank(&self.sb_remove) {
            push("--sponsorblock-remove", Some(remove));
        }

        if self.embed_metadata {
            push("--embed-metadata", None);
        }
        if self.embed_thumbnail {
            push("--embed-thumbnail", None);
        }
        if self.write_thumbnail {
            push("--write-thumbnail", None);
        }

        if let Some(source) = self.cookie_source() {
            push("--cookies-from-browser", Some(&source));
        }

        if let Some(rate) = non_blank(&self.limit_rate) {
            push("--limit-rate", Some(rate));
        }
        if self.concurrent_fragments > 0 {
            push("-N", Some(&self.concurrent_fragments.to_string()));
        }
        if let Some(target) = non_blank(&self.impersonate) {
            push("--impersonate", Some(target));
        }

        if let Some(extra) = non_blank(&self.extra_flags) {
            let split = shell_words::split(extra)
                .map_err(|e| Error::validation(format!("Invalid extra flags: {e}")))?;
            args.extend(split);
        }

        Ok(args)
    }

    /// Map the subset of options the library seam understands.
    pub fn to_library_options(&self) -> LibraryOptions {
        let mut opts = LibraryOptions {
            format: self.format().map(str::to_string),
            format_sort: non_blank(&self.sort_string).map(str::to_string),
            ..LibraryOptions::default()
        };

        if self.write_subs {
            opts.write_subtitles = true;
            opts.subtitle_langs = self
                .subs_langs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            opts.write_auto_subtitles = self.write_auto_subs;
            opts.subtitle_format = non_blank(&self.subs_format).map(str::to_string);
        }

        opts
    }
}
