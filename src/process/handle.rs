use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::config::EngineTimings;
use crate::events::ExitDetails;
use crate::process::kill::{self, KillOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    Pending,
    Exited { code: i32 },
    Signaled { name: String },
}

/// One OS process spawned for a command, possibly a shell wrapping it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    resolved_pid: Mutex<Option<u32>>,
    exit_state: Mutex<ExitState>,
    /// The process leads its own process group.
    group_leader: bool,
    kill_started: AtomicBool,
    kill_options: KillOptions,
    verify_delay: Duration,
}

impl ProcessHandle {
    pub fn new(pid: u32, group_leader: bool, timings: &EngineTimings) -> Self {
        Self {
            pid,
            resolved_pid: Mutex::new(None),
            exit_state: Mutex::new(ExitState::Pending),
            group_leader,
            kill_started: AtomicBool::new(false),
            kill_options: KillOptions {
                group: false,
                attempts: timings.taskkill_attempts,
                backoff: timings.taskkill_backoff,
            },
            verify_delay: timings.kill_verify_delay,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn resolved_pid(&self) -> Option<u32> {
        *self.resolved_pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The pid termination should aim at: the resolved child when known.
    pub fn target_pid(&self) -> u32 {
        self.resolved_pid().unwrap_or(self.pid)
    }

    pub fn exit_state(&self) -> ExitState {
        self.exit_state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_state() != ExitState::Pending
    }

    pub fn mark_exited(&self, details: &ExitDetails) {
        let state = match (&details.signal_name, details.signal, details.exit_code) {
            (Some(name), _, _) => ExitState::Signaled { name: name.clone() },
            (None, Some(signal), _) => ExitState::Signaled { name: format!("signal {}", signal) },
            (None, None, Some(code)) => ExitState::Exited { code },
            (None, None, None) => ExitState::Exited { code: crate::events::UNKNOWN_EXIT_CODE },
        };
        *self.exit_state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Schedules the one-shot child lookup that finds the command behind a shell wrapper.
    pub fn schedule_pid_resolution(self: &Arc<Self>, delay: Duration) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if handle.has_exited() {
                return;
            }
            let pid = handle.pid;
            match tokio::task::spawn_blocking(move || first_child_pid(pid)).await {
                Ok(Some(child)) => {
                    debug!(shell_pid = pid, resolved_pid = child, "Resolved command pid behind shell");
                    *handle.resolved_pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
                }
                Ok(None) => debug!(shell_pid = pid, "No child process found, keeping shell pid"),
                Err(e) => warn!(shell_pid = pid, error = %e, "Pid resolution task failed"),
            }
        });
    }

    pub fn is_alive(&self) -> bool {
        kill::is_alive(self.target_pid())
    }

    /// Kills the process tree. Once the process exited only a group it led is
    /// still signalled, since backgrounded members can outlive the leader.
    /// Returns whether this call ran the kill sequence; a second call never does.
    pub async fn kill(&self, is_main_process: bool) -> bool {
        let group_kill = is_main_process && self.group_leader;
        if self.has_exited() && !group_kill {
            debug!(pid = self.pid, "Process already exited, nothing to kill");
            return false;
        }
        if self.kill_started.swap(true, Ordering::SeqCst) {
            debug!(pid = self.pid, "Kill already in progress");
            return false;
        }

        if self.has_exited() {
            info!(pgid = self.pid, "Leader exited, terminating remaining process group");
            kill::signal_group(self.pid);
            return true;
        }

        let target = self.target_pid();
        info!(pid = self.pid, target_pid = target, is_main_process, "Terminating process tree");

        let mut verify = Vec::new();
        if group_kill {
            let options = KillOptions { group: true, ..self.kill_options.clone() };
            kill::terminate_tree(self.pid, &options).await;
            verify.push(self.pid);
            if target != self.pid {
                verify.push(target);
            }
        } else {
            let options = KillOptions { group: false, ..self.kill_options.clone() };
            kill::terminate_tree(target, &options).await;
            verify.push(target);
            if is_main_process && target != self.pid {
                kill::terminate_tree(self.pid, &options).await;
                verify.push(self.pid);
            }
        }
        kill::spawn_verification(verify, self.verify_delay);
        true
    }
}

/// Earliest-started child of `pid`, ties broken by lowest pid.
pub fn first_child_pid(pid: u32) -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes();
    let parent = Pid::from_u32(pid);
    sys.processes()
        .iter()
        .filter(|(_, process)| process.parent() == Some(parent))
        .map(|(child_pid, process)| (process.start_time(), child_pid.as_u32()))
        .min()
        .map(|(_, child)| child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_falls_back_to_pid() {
        let handle = ProcessHandle::new(4242, true, &EngineTimings::default());
        assert_eq!(handle.target_pid(), 4242);
        *handle.resolved_pid.lock().unwrap() = Some(4243);
        assert_eq!(handle.target_pid(), 4243);
    }

    #[test]
    fn exit_state_from_details() {
        let handle = ProcessHandle::new(1, false, &EngineTimings::default());
        assert_eq!(handle.exit_state(), ExitState::Pending);
        handle.mark_exited(&ExitDetails::from_exit_code(Some(3)));
        assert_eq!(handle.exit_state(), ExitState::Exited { code: 3 });

        let handle = ProcessHandle::new(1, false, &EngineTimings::default());
        handle.mark_exited(&ExitDetails {
            signal: Some(9),
            signal_name: Some("SIGKILL".into()),
            ..Default::default()
        });
        assert_eq!(handle.exit_state(), ExitState::Signaled { name: "SIGKILL".into() });
    }

    #[tokio::test]
    async fn kill_after_exit_is_a_noop_without_a_group() {
        let handle = ProcessHandle::new(999_999, false, &EngineTimings::default());
        handle.mark_exited(&ExitDetails::from_exit_code(Some(0)));
        assert!(!handle.kill(true).await);

        let handle = ProcessHandle::new(999_999, true, &EngineTimings::default());
        handle.mark_exited(&ExitDetails::from_exit_code(Some(0)));
        assert!(!handle.kill(false).await);
    }

    #[cfg(unix)]
    fn is_gone_or_zombie(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => !kill::is_alive(pid),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_leader_still_kills_backgrounded_group_members() {
        use tokio::io::AsyncBufReadExt;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & echo $!");
        cmd.stdout(std::process::Stdio::piped());
        cmd.process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        tokio::io::BufReader::new(stdout).read_line(&mut line).await.unwrap();
        let orphan: u32 = line.trim().parse().unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
        assert!(kill::is_alive(orphan));

        let handle = ProcessHandle::new(pid, true, &EngineTimings::default());
        handle.mark_exited(&ExitDetails::from_exit_code(status.code()));
        assert!(handle.kill(true).await);
        assert!(!handle.kill(true).await);

        let mut gone = false;
        for _ in 0..50 {
            if is_gone_or_zombie(orphan) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "backgrounded sleep {} survived the group kill", orphan);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolves_forked_child_and_kills_once() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("sleep 30; echo done");
        cmd.process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let handle = Arc::new(ProcessHandle::new(pid, true, &EngineTimings::default()));
        handle.schedule_pid_resolution(Duration::from_millis(100));
        let mut resolved = None;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            resolved = handle.resolved_pid();
            if resolved.is_some() {
                break;
            }
        }
        let resolved = resolved.expect("sleep child should be found");
        assert_ne!(resolved, pid);
        assert_eq!(handle.target_pid(), resolved);

        assert!(handle.kill(true).await);
        assert!(!handle.kill(true).await);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
