//! Forceful termination of a process and its descendants.
//!
//! POSIX: process-group SIGKILL, falling back to `pkill -9 -P` for direct
//! children and a SIGKILL for the process itself. Windows: `taskkill /T /F`
//! with retries. Every tier is logged; none of them fails the caller.

use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct KillOptions {
    /// The target leads its own process group (POSIX only).
    pub group: bool,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            group: false,
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Runs the kill sequence for `pid` once. Returns whether any tier reported success.
pub async fn terminate_tree(pid: u32, options: &KillOptions) -> bool {
    if pid == 0 {
        warn!("Refusing to terminate pid 0");
        return false;
    }
    #[cfg(unix)]
    {
        terminate_tree_unix(pid, options).await
    }
    #[cfg(windows)]
    {
        terminate_tree_windows(pid, options).await
    }
    #[cfg(not(any(unix, windows)))]
    {
        warn!(pid, ?options, "Process termination is not supported on this platform");
        false
    }
}

#[cfg(unix)]
async fn terminate_tree_unix(pid: u32, options: &KillOptions) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);

    if options.group {
        match killpg(target, Signal::SIGKILL) {
            Ok(()) => {
                info!(pgid = pid, "Sent SIGKILL to process group");
                return true;
            }
            Err(e) => {
                warn!(pgid = pid, error = %e, "Process group kill failed, falling back to per-process kill");
            }
        }
    }

    let mut killed = false;
    match tokio::process::Command::new("pkill")
        .args(["-9", "-P", &pid.to_string()])
        .output()
        .await
    {
        // pkill exits 1 when nothing matched, which is not a failure here
        Ok(output) if output.status.success() => {
            debug!(pid, "Killed child processes with pkill");
            killed = true;
        }
        Ok(output) => {
            debug!(pid, code = ?output.status.code(), "pkill found no child processes");
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to run pkill");
        }
    }

    match kill(target, Signal::SIGKILL) {
        Ok(()) => {
            info!(pid, "Sent SIGKILL to process");
            killed = true;
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "Process already gone");
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to send SIGKILL");
        }
    }
    killed
}

/// SIGKILLs what is left of a process group whose leader already exited.
///
/// No per-pid fallback: the leader's pid may belong to someone else by now,
/// while a pgid stays reserved as long as any member is alive.
pub fn signal_group(pgid: u32) -> bool {
    if pgid == 0 {
        warn!("Refusing to signal process group 0");
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) => {
                info!(pgid, "Sent SIGKILL to orphaned process group");
                true
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pgid, "Process group already empty");
                false
            }
            Err(e) => {
                warn!(pgid, error = %e, "Failed to signal process group");
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        debug!(pgid, "Process groups are not available on this platform");
        false
    }
}

#[cfg(windows)]
async fn terminate_tree_windows(pid: u32, options: &KillOptions) -> bool {
    let attempts = options.attempts.max(1);
    for attempt in 1..=attempts {
        match tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F", "/T"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!(pid, attempt, "taskkill terminated process tree");
                return true;
            }
            Ok(output) => {
                warn!(
                    pid,
                    attempt,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "taskkill failed"
                );
            }
            Err(e) => {
                warn!(pid, attempt, error = %e, "Failed to run taskkill");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(options.backoff * attempt).await;
        }
    }
    warn!(pid, attempts, "Giving up on taskkill");
    false
}

/// Liveness probe for diagnostics. Racy by nature; never use it for control flow.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, System};
        let mut sys = System::new();
        sys.refresh_process(Pid::from_u32(pid))
    }
}

/// Waits `delay`, then logs any target still alive. Detached from the caller.
pub fn spawn_verification(pids: Vec<u32>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for pid in pids {
            if is_alive(pid) {
                warn!(pid, "Process still alive after kill sequence");
            } else {
                debug!(pid, "Verified process is gone");
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn kills_process_group() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30; wait");
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        cmd.process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let options = KillOptions { group: true, ..Default::default() };
        assert!(terminate_tree(pid, &options).await);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit after SIGKILL")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn falls_back_when_not_a_group_leader() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        // not a group leader, so killpg fails and the per-process tier runs
        let options = KillOptions { group: true, ..Default::default() };
        assert!(terminate_tree(pid, &options).await);
        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit")
            .unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn empty_group_signal_reports_nothing_killed() {
        let mut child = tokio::process::Command::new("true").process_group(0).spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!signal_group(pid));
        assert!(!signal_group(0));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_alive(0));
        assert!(is_alive(std::process::id()));
    }
}
