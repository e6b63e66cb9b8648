use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AppError;
use crate::events::ExitDetails;
use crate::process::handle::ProcessHandle;
use crate::process::stream::{sleep_until_opt, ProcessEnd, StreamState};
use crate::process::CommandProcess;

const READ_CHUNK_SIZE: usize = 8192;

/// Shell used to run command lines, with its "run this string" flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: String,
    pub flag: String,
}

impl ShellSpec {
    pub fn resolve(configured: Option<&str>) -> Self {
        let program = match configured {
            Some(shell) => shell.to_string(),
            None if cfg!(windows) => "cmd.exe".to_string(),
            None => "/bin/sh".to_string(),
        };
        let lower = program.to_lowercase();
        let flag = if lower.contains("powershell") || lower.contains("pwsh") {
            "-Command"
        } else if lower.ends_with("cmd") || lower.ends_with("cmd.exe") {
            "/C"
        } else {
            "-c"
        };
        Self {
            program,
            flag: flag.to_string(),
        }
    }

    pub fn command(&self, command_line: &str) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.arg(&self.flag).arg(command_line);
        cmd
    }
}

/// Runs a command line as a child shell process and streams its pipes.
#[derive(Debug)]
pub struct SpawnedProcess {
    command: String,
    cwd: PathBuf,
    shell: ShellSpec,
}

impl SpawnedProcess {
    pub fn new(command: &str, cwd: PathBuf, shell: ShellSpec) -> Self {
        Self {
            command: command.to_string(),
            cwd,
            shell,
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = self.shell.command(&self.command);
        cmd.current_dir(&self.cwd);
        cmd.stdin(StdProcessStdio::null());
        cmd.stdout(StdProcessStdio::piped());
        cmd.stderr(StdProcessStdio::piped());
        // own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = stream_name, error = %e, "Failed to read command output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl CommandProcess for SpawnedProcess {
    #[instrument(skip(self, stream), fields(command = %self.command, cwd = %self.cwd.display()))]
    async fn run(self: Box<Self>, mut stream: StreamState) -> ProcessEnd {
        debug!(shell = %self.shell.program, "Spawning command");
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to spawn command");
                return stream.fail(AppError::SpawnError(format!("'{}': {}", self.command, e)).to_string());
            }
        };

        let control = Arc::clone(&stream.control);
        let handle = child.id().map(|pid| {
            let handle = Arc::new(ProcessHandle::new(pid, cfg!(unix), stream.timings()));
            handle.schedule_pid_resolution(stream.timings().pid_resolve_delay);
            control.set_handle(Arc::clone(&handle));
            handle
        });
        info!(pid = ?child.id(), "Command started");

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, chunk_tx.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, chunk_tx.clone(), "stderr");
        }
        drop(chunk_tx);

        stream.start();

        let mut exit: Option<ExitDetails> = None;
        let mut pipes_open = true;
        let mut wait_error: Option<String> = None;
        // descendants may hold the pipes open after the shell itself exited
        let mut pipe_deadline: Option<Instant> = None;

        while exit.is_none() || pipes_open {
            if exit.is_some() && pipe_deadline.is_some_and(|d| d <= Instant::now()) {
                debug!("Pipes still open after exit, no longer waiting for them");
                break;
            }
            let deadline = [stream.next_deadline(), pipe_deadline].into_iter().flatten().min();
            tokio::select! {
                biased;
                _ = control.abort_requested.notified() => {
                    if let Some(handle) = &handle {
                        handle.kill(true).await;
                    }
                    control.mark_kill_attempted();
                    let details = match exit.take() {
                        // the shell already exited; only its group was left to kill
                        Some(details) => details,
                        None => {
                            // reap the killed shell without blocking on its verification
                            let status = tokio::time::timeout(stream.timings().kill_verify_delay, child.wait()).await;
                            let details = match status {
                                Ok(Ok(status)) => ExitDetails::from_status(status),
                                _ => ExitDetails::unknown(),
                            };
                            if let Some(handle) = &handle {
                                handle.mark_exited(&details);
                            }
                            details
                        }
                    };
                    while let Ok(bytes) = chunk_rx.try_recv() {
                        stream.on_data(&bytes);
                    }
                    let output = stream.complete();
                    return ProcessEnd { exit: Some(details), output, aborted: true, error: None, shell_closed: false };
                }
                status = child.wait(), if exit.is_none() => {
                    let details = match status {
                        Ok(status) => ExitDetails::from_status(status),
                        Err(e) => {
                            warn!(error = %e, "Failed to wait for command");
                            wait_error = Some(AppError::ProcessError(format!("Failed to wait for command: {}", e)).to_string());
                            ExitDetails::unknown()
                        }
                    };
                    info!(exit_code = ?details.exit_code, signal = ?details.signal_name, "Command finished");
                    if let Some(handle) = &handle {
                        handle.mark_exited(&details);
                    }
                    exit = Some(details);
                    pipe_deadline = Some(Instant::now() + stream.timings().stream_drain_timeout);
                }
                chunk = chunk_rx.recv(), if pipes_open => {
                    match chunk {
                        Some(bytes) => stream.on_data(&bytes),
                        None => pipes_open = false,
                    }
                }
                _ = control.detach_requested.notified() => stream.detach(),
                _ = control.stop_requested.notified() => {
                    debug!("Stop requested before the command finished");
                    break;
                }
                _ = sleep_until_opt(deadline) => stream.on_timers(),
            }
        }

        let output = stream.complete();
        ProcessEnd {
            exit,
            output,
            aborted: false,
            error: wait_error,
            shell_closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_flags_follow_the_program() {
        assert_eq!(ShellSpec::resolve(Some("/bin/bash")).flag, "-c");
        assert_eq!(ShellSpec::resolve(Some("powershell.exe")).flag, "-Command");
        assert_eq!(ShellSpec::resolve(Some("pwsh")).flag, "-Command");
        assert_eq!(ShellSpec::resolve(Some("C:\\Windows\\System32\\cmd.exe")).flag, "/C");
    }

    #[cfg(unix)]
    #[test]
    fn default_shell_is_posix_sh() {
        assert_eq!(
            ShellSpec::resolve(None),
            ShellSpec { program: "/bin/sh".into(), flag: "-c".into() }
        );
    }
}
