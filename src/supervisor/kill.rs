//! Process-tree termination.
//!
//! Compiled toolchains spawn sub-processes (`java` under a JVM launcher,
//! shells under `make`), so killing only the direct child leaves orphans.
//! Children are spawned into their own process group (see
//! [`super::command_for`]) and this module is the single place that knows
//! how to bring the whole tree down on each platform.

use tokio::process::Child;
use tracing::{debug, warn};

/// Kill the entire process tree rooted at `child` and reap it.
///
/// Termination failures are logged and swallowed: the caller's cleanup
/// (workspace removal, session entry) must proceed regardless, and a process
/// that already exited is the common case, not an error.
#[cfg(unix)]
pub async fn terminate(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pid),
        Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!("Failed to signal process group {}: {}", pid, e);
            // Fall back to the direct child only
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill process {}: {}", pid, e);
            }
        }
    }

    if let Err(e) = child.wait().await {
        warn!("Failed to reap process {}: {}", pid, e);
    }
}

/// Kill the entire process tree rooted at `child` and reap it.
#[cfg(windows)]
pub async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };

    let result = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => debug!("Killed process tree {}", pid),
        Ok(output) => warn!(
            "taskkill for {} exited with {:?}: {}",
            pid,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        ),
        Err(e) => {
            warn!("Failed to run taskkill for {}: {}", pid, e);
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill process {}: {}", pid, e);
            }
        }
    }

    if let Err(e) = child.wait().await {
        warn!("Failed to reap process {}: {}", pid, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::languages::CommandStep;
    use crate::supervisor::command_for;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn terminate_brings_down_a_long_running_child() {
        let step = CommandStep {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
        };
        let mut child = command_for(&step, std::env::temp_dir().as_path())
            .spawn()
            .unwrap();

        let start = Instant::now();
        terminate(&mut child).await;
        assert!(start.elapsed() < Duration::from_secs(5));

        // Reaped: no pid remains
        assert!(child.id().is_none());
    }

    #[tokio::test]
    async fn terminate_is_a_no_op_for_an_exited_child() {
        let step = CommandStep {
            program: "sh".into(),
            args: vec!["-c".into(), "true".into()],
        };
        let mut child = command_for(&step, std::env::temp_dir().as_path())
            .spawn()
            .unwrap();
        child.wait().await.unwrap();

        // Must not error or hang
        terminate(&mut child).await;
    }
}
