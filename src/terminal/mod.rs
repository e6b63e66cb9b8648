pub mod compound;
pub mod registry;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::events::{ExitDetails, RunOutcome, TerminalEvent};
use crate::process::integrated::IntegratedProcess;
use crate::process::integration::{IntegrationShell, ShellCompletion};
use crate::process::spawned::{ShellSpec, SpawnedProcess};
use crate::process::stream::{sleep_until_opt, ProcessEnd, StreamState};
use crate::process::{CommandProcess, RunControl};
use crate::utils::path_utils::normalize_cwd;
use crate::utils::patterns::CommandPatterns;
use crate::utils::text::{compress_output, strip_ansi};

pub use compound::{split_compound_command, CompletionRecord, CompoundProgress, CompoundState};
pub use registry::{BackgroundOutput, TerminalRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Commands run inside an editor shell and are followed through its markers.
    Integrated,
    /// Each command is its own child shell process.
    Spawned,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Seconds until a `command_timeout` event; 0 disables it.
    pub timeout_secs: u64,
    /// Commands matching one of these (exact or `prefix*`) are not waited for.
    pub background_patterns: Vec<String>,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout_secs: config.command_timeout_secs,
            background_patterns: config.background_commands.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub id: u32,
    pub kind: ProviderKind,
    pub owner: Option<String>,
    pub cwd: PathBuf,
    pub busy: bool,
    pub running: bool,
    pub closed: bool,
    pub command: Option<String>,
    pub pid: Option<u32>,
    pub start_time_iso: Option<String>,
    pub runtime_ms: Option<u128>,
}

#[derive(Debug)]
struct ActiveRun {
    run_id: Uuid,
    control: Arc<RunControl>,
    start_time: std::time::Instant,
    start_time_system: SystemTime,
}

#[derive(Debug)]
struct TerminalState {
    cwd: PathBuf,
    owner: Option<String>,
    busy: bool,
    running: bool,
    closed: bool,
    active: Option<ActiveRun>,
    compound: CompoundState,
    last_run: Option<Arc<RunControl>>,
    last_command: Option<String>,
}

#[derive(Debug)]
struct TerminalInner {
    id: u32,
    kind: ProviderKind,
    initial_cwd: PathBuf,
    config: Arc<Config>,
    shell: Option<Arc<dyn IntegrationShell>>,
    state: Mutex<TerminalState>,
}

/// A reusable command-execution context. Runs at most one command at a time.
#[derive(Debug, Clone)]
pub struct Terminal {
    inner: Arc<TerminalInner>,
}

impl Terminal {
    pub fn new_spawned(id: u32, cwd: PathBuf, config: Arc<Config>) -> Self {
        Self::build(id, ProviderKind::Spawned, cwd, config, None)
    }

    pub fn new_integrated(id: u32, cwd: PathBuf, config: Arc<Config>, shell: Arc<dyn IntegrationShell>) -> Self {
        Self::build(id, ProviderKind::Integrated, cwd, config, Some(shell))
    }

    fn build(
        id: u32,
        kind: ProviderKind,
        cwd: PathBuf,
        config: Arc<Config>,
        shell: Option<Arc<dyn IntegrationShell>>,
    ) -> Self {
        Self {
            inner: Arc::new(TerminalInner {
                id,
                kind,
                initial_cwd: cwd.clone(),
                config,
                shell,
                state: Mutex::new(TerminalState {
                    cwd,
                    owner: None,
                    busy: false,
                    running: false,
                    closed: false,
                    active: None,
                    compound: CompoundState::default(),
                    last_run: None,
                    last_command: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TerminalState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn kind(&self) -> ProviderKind {
        self.inner.kind
    }

    pub fn initial_cwd(&self) -> &PathBuf {
        &self.inner.initial_cwd
    }

    pub fn cwd(&self) -> PathBuf {
        self.state().cwd.clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.state().owner.clone()
    }

    pub(crate) fn set_owner(&self, owner: Option<&str>) {
        self.state().owner = owner.map(String::from);
    }

    /// True from admission until the run is finalized.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    /// True while the command's process is still running.
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn is_available(&self) -> bool {
        let state = self.state();
        !state.busy && !state.closed
    }

    pub fn info(&self) -> TerminalInfo {
        let state = self.state();
        let active = state.active.as_ref();
        TerminalInfo {
            id: self.inner.id,
            kind: self.inner.kind,
            owner: state.owner.clone(),
            cwd: state.cwd.clone(),
            busy: state.busy,
            running: state.running,
            closed: state.closed,
            command: state.last_command.clone(),
            pid: active.and_then(|a| a.control.handle()).map(|h| h.pid()),
            start_time_iso: active.map(|a| chrono::DateTime::<chrono::Utc>::from(a.start_time_system).to_rfc3339()),
            runtime_ms: active.map(|a| a.start_time.elapsed().as_millis()),
        }
    }

    /// Starts `command` on this terminal. Fails without side effects when the
    /// command is blocked or the terminal is busy or closed.
    #[instrument(skip(self, command, options), fields(terminal_id = self.inner.id, command = %command))]
    pub fn run(&self, command: &str, options: RunOptions) -> Result<RunHandle, AppError> {
        if self.inner.config.is_command_blocked(command) {
            warn!("Command is blocked by configuration");
            return Err(AppError::CommandBlocked(command.to_string()));
        }

        let control = Arc::new(RunControl::new(command));
        let run_id = Uuid::new_v4();
        let cwd = {
            let mut state = self.state();
            if state.closed {
                return Err(AppError::TerminalClosed(self.inner.id));
            }
            if state.busy {
                return Err(AppError::TerminalBusy(self.inner.id));
            }
            state.busy = true;
            state.running = true;
            state.active = Some(ActiveRun {
                run_id,
                control: Arc::clone(&control),
                start_time: std::time::Instant::now(),
                start_time_system: SystemTime::now(),
            });
            state.last_run = Some(Arc::clone(&control));
            state.last_command = Some(command.to_string());
            state.cwd.clone()
        };
        self.detect_compound_command(command);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let stream = StreamState::new(
            Arc::clone(&control),
            event_tx.clone(),
            self.inner.config.timings.clone(),
            options.timeout_secs,
            CommandPatterns::compile(&options.background_patterns),
        );
        let process: Box<dyn CommandProcess> = match &self.inner.shell {
            Some(shell) => Box::new(IntegratedProcess::new(command, Arc::clone(shell), completion_tx)),
            None => {
                drop(completion_tx);
                let shell = ShellSpec::resolve(self.inner.config.default_shell.as_deref());
                Box::new(SpawnedProcess::new(command, cwd, shell))
            }
        };

        info!(run_id = %run_id, kind = ?self.inner.kind, "Command admitted");
        tokio::spawn(self.clone().supervise(run_id, process, stream, completion_rx, event_tx, outcome_tx));

        Ok(RunHandle {
            terminal_id: self.inner.id,
            run_id,
            control,
            events: event_rx,
            outcome_rx: Some(outcome_rx),
            outcome: None,
        })
    }

    /// Records how many completion notifications the current command should produce.
    pub fn detect_compound_command(&self, command: &str) -> bool {
        let compound = CompoundState::detect(command);
        let is_compound = compound.is_compound;
        if is_compound {
            debug!(terminal_id = self.inner.id, sub_commands = ?compound.sub_commands, "Compound command detected");
        }
        self.state().compound = compound;
        is_compound
    }

    pub fn is_compound_command(&self) -> bool {
        self.state().compound.is_compound
    }

    pub fn expected_compound_process_count(&self) -> usize {
        self.state().compound.expected
    }

    pub fn compound_completions(&self) -> Vec<CompletionRecord> {
        self.state().compound.completions.clone()
    }

    /// Records one sub-command completion. Returns `Complete` with the last
    /// record's exit details once all expected completions arrived; otherwise
    /// (re)arms the finalize timeout.
    pub fn add_compound_process_completion(&self, exit_details: ExitDetails, sub_command: &str) -> CompoundProgress {
        let mut state = self.state();
        if state.active.is_none() {
            debug!(terminal_id = self.inner.id, "Completion received with no active command, ignoring");
            return CompoundProgress::Inactive;
        }
        let sub_command = if sub_command.trim().is_empty() {
            state.compound.next_sub_command()
        } else {
            sub_command.to_string()
        };
        state.compound.completions.push(CompletionRecord {
            exit_details: exit_details.clone(),
            sub_command,
        });

        let received = state.compound.completions.len();
        let expected = state.compound.expected;
        if received >= expected {
            state.compound.finalize_deadline = None;
            CompoundProgress::Complete(exit_details)
        } else {
            state.compound.finalize_deadline = Some(Instant::now() + self.inner.config.timings.compound_finalize_timeout);
            CompoundProgress::Pending { received, expected }
        }
    }

    fn arm_finalize_timer(&self) {
        let timeout = self.inner.config.timings.compound_finalize_timeout;
        let mut state = self.state();
        if state.active.is_some() && state.compound.finalize_deadline.is_none() {
            state.compound.finalize_deadline = Some(Instant::now() + timeout);
        }
    }

    fn mark_process_ended(&self, run_id: Uuid) {
        let mut state = self.state();
        if state.active.as_ref().is_some_and(|a| a.run_id == run_id) {
            state.running = false;
        }
    }

    /// Clears the terminal's run state. Only the run that is currently active
    /// can be finalized; any other call is a no-op returning false.
    pub(crate) fn finalize(&self, run_id: Uuid, shell_closed: bool) -> bool {
        let shell_cwd = if shell_closed {
            None
        } else {
            self.inner.shell.as_ref().and_then(|shell| shell.cwd())
        };
        let mut state = self.state();
        if state.active.as_ref().map(|a| a.run_id) != Some(run_id) {
            debug!(terminal_id = self.inner.id, run_id = %run_id, "Ignoring finalize for a run that is not active");
            return false;
        }
        state.active = None;
        state.busy = false;
        state.running = false;
        state.compound = CompoundState::default();
        if shell_closed {
            state.closed = true;
        }
        if let Some(cwd) = shell_cwd {
            state.cwd = normalize_cwd(&cwd).unwrap_or(cwd);
        }
        true
    }

    /// Aborts the active command, if any.
    pub async fn abort(&self) {
        let control = self.state().active.as_ref().map(|a| Arc::clone(&a.control));
        if let Some(control) = control {
            control.abort().await;
        }
    }

    /// Output of the latest command not yet retrieved by anyone.
    pub fn unretrieved_output(&self) -> Option<String> {
        let control = self.state().last_run.clone()?;
        Some(take_unretrieved(&control))
    }

    pub(crate) fn last_run(&self) -> Option<Arc<RunControl>> {
        self.state().last_run.clone()
    }

    /// Marks the terminal closed and disposes its integrated shell.
    pub(crate) async fn close(&self) {
        self.state().closed = true;
        if let Some(shell) = &self.inner.shell {
            shell.dispose().await;
        }
    }

    async fn supervise(
        self,
        run_id: Uuid,
        process: Box<dyn CommandProcess>,
        stream: StreamState,
        mut completions: mpsc::UnboundedReceiver<ShellCompletion>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        outcome_tx: oneshot::Sender<RunOutcome>,
    ) {
        let control = Arc::clone(&stream.control);
        let timings = self.inner.config.timings.clone();
        let aggregates = self.inner.shell.is_some();
        let process_fut = process.run(stream);
        tokio::pin!(process_fut);

        let mut end: Option<ProcessEnd> = None;
        let mut aggregated: Option<ExitDetails> = None;
        let mut completions_open = true;
        let mut drain_deadline: Option<Instant> = None;
        let mut aborted_after_exit = false;

        loop {
            if let Some(end) = &end {
                if !aggregates || end.aborted || end.error.is_some() || aggregated.is_some() || !completions_open {
                    break;
                }
            }
            let finalize_deadline = self.state().compound.finalize_deadline;
            tokio::select! {
                result = &mut process_fut, if end.is_none() => {
                    self.mark_process_ended(run_id);
                    if aggregates && aggregated.is_none() && !result.aborted && result.error.is_none() {
                        self.arm_finalize_timer();
                    }
                    end = Some(result);
                }
                completion = completions.recv(), if completions_open => match completion {
                    Some(completion) => {
                        let sub_command = completion.command_line.unwrap_or_default();
                        match self.add_compound_process_completion(completion.exit, &sub_command) {
                            CompoundProgress::Complete(exit) => {
                                aggregated = Some(exit);
                                if end.is_none() {
                                    drain_deadline = Some(Instant::now() + timings.stream_drain_timeout);
                                }
                            }
                            CompoundProgress::Pending { received, expected } => {
                                debug!(received, expected, "Waiting for more sub-command completions");
                            }
                            CompoundProgress::Inactive => {}
                        }
                    }
                    None => completions_open = false,
                },
                _ = sleep_until_opt(finalize_deadline) => {
                    let (last, received, expected) = {
                        let mut state = self.state();
                        state.compound.finalize_deadline = None;
                        (state.compound.last_exit(), state.compound.completions.len(), state.compound.expected)
                    };
                    warn!(received, expected, "Finalize timeout elapsed, using the last completion received");
                    aggregated = Some(
                        last.or_else(|| end.as_ref().and_then(|e| e.exit.clone()))
                            .unwrap_or_else(ExitDetails::unknown),
                    );
                    if end.is_none() {
                        control.stop_requested.notify_one();
                    }
                }
                _ = sleep_until_opt(drain_deadline), if end.is_none() => {
                    drain_deadline = None;
                    debug!("Shell reported completion but output is still open, stopping");
                    control.stop_requested.notify_one();
                }
                _ = control.abort_requested.notified(), if end.is_some() => {
                    info!("Abort requested after the process exited");
                    aborted_after_exit = true;
                    control.mark_kill_attempted();
                    break;
                }
            }
        }

        let end = end.unwrap_or_default();
        let exit = aggregated
            .or_else(|| self.state().compound.last_exit())
            .or_else(|| end.exit.clone())
            .unwrap_or_else(ExitDetails::unknown);
        let output = compress_output(&strip_ansi(&end.output), self.inner.config.output_line_limit);
        let outcome = match end.error {
            Some(error) => RunOutcome::Failed { error, exit: exit.clone() },
            None if end.aborted || aborted_after_exit => RunOutcome::Aborted { output, exit: exit.clone() },
            None => RunOutcome::Completed { output, exit: exit.clone() },
        };

        if self.finalize(run_id, end.shell_closed) {
            info!(
                terminal_id = self.inner.id,
                run_id = %run_id,
                exit_code = ?exit.exit_code,
                signal = ?exit.signal_name,
                "Run finalized"
            );
        }
        let _ = events.send(TerminalEvent::ShellExecutionComplete(exit));
        // the caller may have dropped its handle
        let _ = outcome_tx.send(outcome);
        control.mark_finished();
    }
}

fn take_unretrieved(control: &RunControl) -> String {
    let finished = control.is_finished();
    let mut output = control.output();
    let text = if finished { output.drain_all() } else { output.drain() };
    strip_ansi(&text)
}

/// How a caller stopped waiting on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Finished(RunOutcome),
    /// The command matched a background pattern; it keeps running.
    Background,
    /// The timeout elapsed; the command keeps running.
    TimedOut,
}

/// The caller's side of one admitted command.
#[derive(Debug)]
pub struct RunHandle {
    terminal_id: u32,
    run_id: Uuid,
    control: Arc<RunControl>,
    events: mpsc::UnboundedReceiver<TerminalEvent>,
    outcome_rx: Option<oneshot::Receiver<RunOutcome>>,
    outcome: Option<RunOutcome>,
}

impl RunHandle {
    pub fn terminal_id(&self) -> u32 {
        self.terminal_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn command(&self) -> &str {
        self.control.command()
    }

    /// Next event of the run, in emission order. `None` once the run is over.
    pub async fn next_event(&mut self) -> Option<TerminalEvent> {
        self.events.recv().await
    }

    /// Waits for the run's final result.
    pub async fn outcome(&mut self) -> RunOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.outcome_rx.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| RunOutcome::Failed {
                error: "Run ended without reporting an outcome".to_string(),
                exit: ExitDetails::unknown(),
            }),
            None => RunOutcome::Failed {
                error: "Outcome already consumed".to_string(),
                exit: ExitDetails::unknown(),
            },
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Follows the event stream until the run finishes, goes to the
    /// background or times out. Output lines are handed to `on_line`.
    pub async fn settle(&mut self, mut on_line: impl FnMut(&str)) -> Settled {
        while let Some(event) = self.next_event().await {
            match event {
                TerminalEvent::Line(text) => on_line(&text),
                TerminalEvent::BackgroundCommand(_) => return Settled::Background,
                TerminalEvent::CommandTimeout(_) => return Settled::TimedOut,
                TerminalEvent::ShellExecutionComplete(_) => break,
                _ => {}
            }
        }
        Settled::Finished(self.outcome().await)
    }

    pub async fn abort(&self) {
        self.control.abort().await;
    }

    /// Stops line delivery; the command keeps running and its output
    /// remains retrievable.
    pub fn continue_running(&self) {
        if !self.control.is_finished() {
            self.control.detach_requested.notify_one();
        }
    }

    pub fn unretrieved_output(&self) -> String {
        take_unretrieved(&self.control)
    }

    pub fn has_unretrieved_output(&self) -> bool {
        self.control.output().has_unretrieved()
    }

    pub fn full_output(&self) -> String {
        strip_ansi(self.control.output().full_output())
    }

    pub fn is_hot(&self) -> bool {
        self.control.is_hot()
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.handle().map(|h| h.pid())
    }

    pub fn resolved_pid(&self) -> Option<u32> {
        self.control.handle().and_then(|h| h.resolved_pid())
    }
}
