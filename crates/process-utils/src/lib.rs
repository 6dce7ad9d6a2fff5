//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Ask a blocking child process to exit.
///
/// See [`request_terminate`] for the platform behavior.
pub fn request_terminate_std(child: &mut std::process::Child) -> bool {
    #[cfg(unix)]
    {
        send_sigterm(child.id())
    }
    #[cfg(not(unix))]
    {
        child.kill().is_ok()
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    std_command("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Ask a child process to exit, giving it a chance to clean up.
///
/// On Unix this delivers `SIGTERM` through the `kill` utility. Windows has no
/// graceful signal for window-less children, so the request degrades to a
/// forced kill there.
///
/// Returns `false` when the child has already been reaped or the request
/// could not be delivered. Callers are expected to follow up with a bounded
/// wait and a forced kill.
#[cfg(feature = "tokio")]
pub async fn request_terminate(child: &mut tokio::process::Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };

    #[cfg(unix)]
    {
        tokio_command("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        child.start_kill().is_ok()
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn terminate_stops_sleeping_child() {
        let mut child = tokio_command("sleep").arg("30").spawn().unwrap();

        assert!(request_terminate(&mut child).await);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit after SIGTERM")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_reports_reaped_child() {
        let mut child = tokio_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        assert!(!request_terminate(&mut child).await);
    }

    #[test]
    fn terminate_std_child() {
        let mut child = std_command("sleep").arg("30").spawn().unwrap();
        assert!(request_terminate_std(&mut child));
        assert!(!child.wait().unwrap().success());
    }
}
