//! Download strategies.
//!
//! A job runs either through an in-process [`ExtractorLibrary`] or as an
//! engine subprocess driven by a [`ProcessRunner`]. Both implement
//! [`DownloadTask`] and report through a [`ProgressSink`].

mod cli_bridge;
mod library;
mod parser;
mod runner;
mod subprocess;
mod traits;
pub mod utils;

pub use cli_bridge::CliBridge;
pub use library::{
    ExtractorLibrary, HookStatus, LibraryError, LibraryOptions, LibraryRequest, LibraryTask,
    ProgressHook,
};
pub use parser::{
    DownloadingPayload, MARKER, ParseOutcome, ProgressEvent, engine_hook_args, parse_line,
};
pub use runner::{OutputLine, ProcessExit, ProcessRunner, STOP_GRACE, StreamOrigin};
pub use subprocess::SubprocessTask;
pub use traits::{
    DownloadRequest, DownloadStatus, DownloadTask, JobId, ProgressSink, ProgressSnapshot,
    TaskKind, TaskReport,
};

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// ETXTBSY: the script is still open for writing in a forked child.
    const TEXT_FILE_BUSY: i32 = 26;

    /// Write an executable `sh` script standing in for the engine.
    ///
    /// The script ignores its arguments.
    pub fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-engine");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Concurrent test threads may fork while the file was open; wait
        // until it can be executed before handing it out.
        for _ in 0..100 {
            match std::process::Command::new(&path)
                .arg("--version")
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
            {
                Ok(mut child) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return path;
                }
                Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("fake engine not executable: {e}"),
            }
        }
        path
    }
}
