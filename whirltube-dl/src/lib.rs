//! whirltube-dl library crate.
//!
//! Download orchestration for WhirlTube: a bounded-concurrency queue driving
//! yt-dlp either in-process or as a subprocess.

pub mod config;
pub mod downloader;
pub mod error;
pub mod history;
pub mod logging;
pub mod models;
pub mod notify;
pub mod utils;

pub use error::{Error, Result};
