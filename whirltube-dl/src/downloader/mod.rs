//! Download orchestration.
//!
//! - A bounded-concurrency job queue run as a single actor
//! - Two execution strategies behind one task trait: an in-process library
//!   call and an engine subprocess
//! - Queue snapshots so that pending work survives a restart

pub mod engine;

mod manager;
mod persistence;

pub use engine::{
    CliBridge, DownloadRequest, DownloadStatus, DownloadTask, ExtractorLibrary, JobId,
    ProgressSink, ProgressSnapshot, TaskKind,
};
pub use manager::{EngineTaskFactory, Job, JobEvent, JobQueue, JobState, TaskFactory};
pub use persistence::{QueueEntry, QueueStore, load_queue};
