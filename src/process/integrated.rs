use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::events::ExitDetails;
use crate::process::handle::ProcessHandle;
use crate::process::integration::{IntegrationShell, ShellCompletion};
use crate::process::markers::{MarkerEvent, MarkerParser};
use crate::process::stream::{sleep_until_opt, ProcessEnd, StreamState};
use crate::process::CommandProcess;

/// Runs a command inside an editor-integrated shell and follows its
/// command-start / command-end markers.
#[derive(Debug)]
pub struct IntegratedProcess {
    command: String,
    shell: Arc<dyn IntegrationShell>,
    completions: mpsc::UnboundedSender<ShellCompletion>,
}

enum Step {
    Continue,
    Ended(Option<i32>),
}

impl IntegratedProcess {
    pub fn new(
        command: &str,
        shell: Arc<dyn IntegrationShell>,
        completions: mpsc::UnboundedSender<ShellCompletion>,
    ) -> Self {
        Self {
            command: command.to_string(),
            shell,
            completions,
        }
    }
}

/// Output before the start marker is prompt noise; it is kept aside only in
/// case the shell never sends a start marker.
struct MarkerTracker {
    parser: MarkerParser,
    started: bool,
    prompt_noise: Vec<u8>,
}

impl MarkerTracker {
    fn new() -> Self {
        Self {
            parser: MarkerParser::new(),
            started: false,
            prompt_noise: Vec::new(),
        }
    }

    fn feed(&mut self, bytes: &[u8], stream: &mut StreamState) -> Step {
        for event in self.parser.feed(bytes) {
            match event {
                MarkerEvent::Output(data) => {
                    if self.started {
                        stream.on_data(&data);
                    } else {
                        self.prompt_noise.extend_from_slice(&data);
                    }
                }
                MarkerEvent::CommandStart => {
                    debug!("Command start marker received");
                    self.started = true;
                    self.prompt_noise.clear();
                }
                MarkerEvent::CommandEnd(code) => {
                    debug!(exit_code = ?code, "Command end marker received");
                    self.promote_noise(stream);
                    return Step::Ended(code);
                }
            }
        }
        Step::Continue
    }

    fn finish(&mut self, stream: &mut StreamState) {
        if let Some(MarkerEvent::Output(rest)) = self.parser.finish() {
            if self.started {
                stream.on_data(&rest);
            } else {
                self.prompt_noise.extend_from_slice(&rest);
            }
        }
        self.promote_noise(stream);
    }

    fn promote_noise(&mut self, stream: &mut StreamState) {
        if !self.started && !self.prompt_noise.is_empty() {
            warn!("No command start marker seen, using all shell output");
            let noise = std::mem::take(&mut self.prompt_noise);
            stream.on_data(&noise);
        }
    }
}

#[async_trait]
impl CommandProcess for IntegratedProcess {
    #[instrument(skip(self, stream), fields(command = %self.command))]
    async fn run(self: Box<Self>, mut stream: StreamState) -> ProcessEnd {
        let control = Arc::clone(&stream.control);
        let handle = self.shell.pid().map(|pid| {
            let handle = Arc::new(ProcessHandle::new(pid, false, stream.timings()));
            handle.schedule_pid_resolution(stream.timings().pid_resolve_delay);
            control.set_handle(Arc::clone(&handle));
            handle
        });

        let executed = tokio::select! {
            biased;
            _ = control.abort_requested.notified() => {
                return self.abort_before_execution(stream, handle).await;
            }
            executed = self.shell.execute(&self.command) => executed,
        };
        let execution = match executed {
            Ok(execution) => execution,
            Err(e) => {
                error!(error = %e, "Shell integration failed to execute command");
                return stream.fail(e.to_string());
            }
        };
        let mut data = execution.data;
        let mut shell_completions = execution.completions;

        // completion notifications belong to the terminal, not to this stream
        let forward = self.completions.clone();
        tokio::spawn(async move {
            while let Some(completion) = shell_completions.recv().await {
                if forward.send(completion).is_err() {
                    break;
                }
            }
        });

        stream.start();
        let mut tracker = MarkerTracker::new();

        loop {
            let deadline = stream.next_deadline();
            tokio::select! {
                biased;
                _ = control.abort_requested.notified() => {
                    return self.abort(stream, &mut data, &mut tracker, handle).await;
                }
                chunk = data.recv() => match chunk {
                    Some(bytes) => {
                        if let Step::Ended(code) = tracker.feed(&bytes, &mut stream) {
                            let output = stream.complete();
                            return ProcessEnd {
                                exit: Some(ExitDetails::from_exit_code(code)),
                                output,
                                ..Default::default()
                            };
                        }
                    }
                    None => {
                        debug!("Shell data stream closed without an end marker");
                        tracker.finish(&mut stream);
                        let output = stream.complete();
                        return ProcessEnd { exit: None, output, ..Default::default() };
                    }
                },
                _ = control.detach_requested.notified() => stream.detach(),
                _ = control.stop_requested.notified() => {
                    debug!("Stop requested, no longer following the shell stream");
                    tracker.finish(&mut stream);
                    let output = stream.complete();
                    return ProcessEnd { exit: None, output, ..Default::default() };
                }
                _ = sleep_until_opt(deadline) => stream.on_timers(),
            }
        }
    }
}

impl IntegratedProcess {
    /// Abort that arrived while the shell had not accepted the command yet.
    /// Nothing tells us what the shell is doing, so it is not reused.
    async fn abort_before_execution(&self, mut stream: StreamState, handle: Option<Arc<ProcessHandle>>) -> ProcessEnd {
        warn!("Aborted before the shell accepted the command, closing the shell");
        let control = Arc::clone(&stream.control);
        if let Err(e) = self.shell.send_interrupt().await {
            warn!(error = %e, "Failed to send interrupt to shell");
        }
        if let Some(handle) = &handle {
            handle.kill(true).await;
        }
        control.mark_kill_attempted();
        self.shell.dispose().await;
        let output = stream.complete();
        ProcessEnd {
            exit: None,
            output,
            aborted: true,
            error: None,
            shell_closed: true,
        }
    }

    /// Interrupts the shell, then waits up to the grace period for the
    /// command to end before killing the shell's process tree.
    async fn abort(
        &self,
        mut stream: StreamState,
        data: &mut mpsc::Receiver<Vec<u8>>,
        tracker: &mut MarkerTracker,
        handle: Option<Arc<ProcessHandle>>,
    ) -> ProcessEnd {
        let control = Arc::clone(&stream.control);
        info!("Aborting command, sending interrupt to shell");
        if let Err(e) = self.shell.send_interrupt().await {
            warn!(error = %e, "Failed to send interrupt to shell");
        }
        control.mark_kill_attempted();

        let grace_deadline = Instant::now() + stream.timings().abort_grace;
        let mut exit = None;
        let mut ended = false;
        while !ended {
            tokio::select! {
                chunk = data.recv() => match chunk {
                    Some(bytes) => {
                        if let Step::Ended(code) = tracker.feed(&bytes, &mut stream) {
                            exit = Some(ExitDetails::from_exit_code(code));
                            ended = true;
                        }
                    }
                    None => ended = true,
                },
                _ = tokio::time::sleep_until(grace_deadline) => break,
            }
        }

        let mut shell_closed = false;
        if !ended {
            warn!(grace = ?stream.timings().abort_grace, "Command ignored the interrupt, killing the shell");
            if let Some(handle) = &handle {
                handle.kill(true).await;
            }
            self.shell.dispose().await;
            shell_closed = true;
        }
        tracker.finish(&mut stream);
        let output = stream.complete();
        ProcessEnd {
            exit,
            output,
            aborted: true,
            error: None,
            shell_closed,
        }
    }
}
