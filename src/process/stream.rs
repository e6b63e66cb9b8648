use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineTimings;
use crate::events::{ExitDetails, TerminalEvent};
use crate::process::control::RunControl;
use crate::utils::patterns::CommandPatterns;
use crate::utils::text::strip_ansi;

const COMPILING_MARKERS: &[&str] = &["compiling", "building", "bundling", "transpiling", "generating", "starting"];
const COMPILING_NULLIFIERS: &[&str] = &[
    "compiled", "success", "finish", "complete", "succeed", "done", "end", "stop", "exit", "terminate", "error", "fail",
];

/// What a command process reports to its terminal when it stops.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnd {
    /// Exit details the process itself observed (exit status or end marker).
    pub exit: Option<ExitDetails>,
    pub output: String,
    pub aborted: bool,
    pub error: Option<String>,
    /// The shell behind the terminal was killed and cannot be reused.
    pub shell_closed: bool,
}

/// Streaming bookkeeping shared by both process variants: output capture,
/// rate-limited `line` emission, hot/idle tracking, timeout and background
/// detection.
#[derive(Debug)]
pub struct StreamState {
    pub(crate) control: Arc<RunControl>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    timings: EngineTimings,
    timeout: Option<Duration>,
    background: CommandPatterns,
    last_emit: Option<Instant>,
    hot_deadline: Option<Instant>,
    timeout_deadline: Option<Instant>,
    detached: bool,
    completed: bool,
}

impl StreamState {
    pub fn new(
        control: Arc<RunControl>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        timings: EngineTimings,
        timeout_secs: u64,
        background: CommandPatterns,
    ) -> Self {
        Self {
            control,
            events,
            timings,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            background,
            last_emit: None,
            hot_deadline: None,
            timeout_deadline: None,
            detached: false,
            completed: false,
        }
    }

    pub fn command(&self) -> &str {
        self.control.command()
    }

    pub fn timings(&self) -> &EngineTimings {
        &self.timings
    }

    fn emit(&self, event: TerminalEvent) {
        if self.detached {
            return;
        }
        // the receiver may be gone if the caller dropped its handle
        let _ = self.events.send(event);
    }

    /// Called once the process is running: arms the timeout and checks the
    /// background patterns.
    pub fn start(&mut self) {
        if let Some(timeout) = self.timeout {
            self.timeout_deadline = Some(Instant::now() + timeout);
        }
        if self.background.matches(self.control.command()) {
            info!(command = %self.control.command(), "Command matches a background pattern, not waiting for exit");
            self.control.set_listening(false);
            self.emit(TerminalEvent::BackgroundCommand(self.control.command().to_string()));
        }
    }

    pub fn on_data(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.control.output().append(bytes);
        self.start_hot_timer(bytes);
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.timings.flush_interval,
        };
        if due {
            self.flush();
        }
    }

    fn start_hot_timer(&mut self, latest: &[u8]) {
        let text = String::from_utf8_lossy(latest).to_lowercase();
        let compiling = COMPILING_MARKERS.iter().any(|m| text.contains(m))
            && !COMPILING_NULLIFIERS.iter().any(|n| text.contains(n));
        let idle = if compiling {
            self.timings.hot_timeout_compiling
        } else {
            self.timings.hot_timeout
        };
        self.control.set_hot(true);
        self.hot_deadline = Some(Instant::now() + idle);
    }

    /// Emits complete lines gathered since the last retrieval, if listening.
    fn flush(&mut self) {
        if !self.control.is_listening() || self.detached {
            return;
        }
        // a trailing partial line drains to nothing; the attempt still counts
        // so the flush timer re-arms one interval later
        self.last_emit = Some(Instant::now());
        let delta = self.control.output().drain();
        if delta.is_empty() {
            return;
        }
        self.emit(TerminalEvent::Line(strip_ansi(&delta)));
    }

    fn flush_deadline(&self) -> Option<Instant> {
        if !self.control.is_listening() || self.detached {
            return None;
        }
        let last = self.last_emit?;
        if self.control.output().has_unretrieved() {
            Some(last + self.timings.flush_interval)
        } else {
            None
        }
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.hot_deadline, self.timeout_deadline, self.flush_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn on_timers(&mut self) {
        let now = Instant::now();
        if self.hot_deadline.is_some_and(|d| d <= now) {
            self.hot_deadline = None;
            self.control.set_hot(false);
            debug!(command = %self.control.command(), "Process cooled down");
        }
        if self.timeout_deadline.is_some_and(|d| d <= now) {
            self.timeout_deadline = None;
            warn!(command = %self.control.command(), timeout = ?self.timeout, "Command timed out, leaving it running");
            self.emit(TerminalEvent::CommandTimeout(self.control.command().to_string()));
        }
        if self.flush_deadline().is_some_and(|d| d <= now) {
            self.flush();
        }
    }

    /// Stops line delivery and emits `continue`; output keeps accumulating.
    pub fn detach(&mut self) {
        if self.detached || self.completed {
            return;
        }
        self.flush();
        self.control.set_listening(false);
        self.emit(TerminalEvent::Continue);
        self.detached = true;
        debug!(command = %self.control.command(), "Listener detached, process keeps running");
    }

    /// Final flush, then `completed(fullOutput)` and `continue`.
    pub fn complete(&mut self) -> String {
        self.hot_deadline = None;
        self.timeout_deadline = None;
        self.control.set_hot(false);
        let full_output = {
            let mut output = self.control.output();
            output.finish();
            output.full_output().to_string()
        };
        if !self.completed {
            self.completed = true;
            if self.control.is_listening() && !self.detached {
                let rest = self.control.output().drain_all();
                if !rest.is_empty() {
                    self.emit(TerminalEvent::Line(strip_ansi(&rest)));
                }
            }
            self.emit(TerminalEvent::Completed(strip_ansi(&full_output)));
            self.emit(TerminalEvent::Continue);
        }
        full_output
    }

    /// Ends a run that never got a process.
    pub fn fail(&mut self, error: String) -> ProcessEnd {
        let output = self.complete();
        ProcessEnd {
            exit: Some(ExitDetails::unknown()),
            output,
            aborted: false,
            error: Some(error),
            shell_closed: false,
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state(timeout_secs: u64, patterns: &[&str]) -> (StreamState, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(RunControl::new("npm run dev"));
        let state = StreamState::new(
            control,
            tx,
            EngineTimings::default(),
            timeout_secs,
            CommandPatterns::compile(patterns),
        );
        (state, rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<TerminalEvent>) -> Vec<TerminalEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn emissions_are_rate_limited() {
        let (mut state, mut rx) = new_state(0, &[]);
        state.start();
        state.on_data(b"first\n");
        state.on_data(b"second\n");
        assert_eq!(drain_events(&mut rx), vec![TerminalEvent::Line("first\n".into())]);

        tokio::time::advance(Duration::from_millis(500)).await;
        state.on_timers();
        assert_eq!(drain_events(&mut rx), vec![TerminalEvent::Line("second\n".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_line_waits_for_completion() {
        let (mut state, mut rx) = new_state(0, &[]);
        state.start();
        state.on_data(b"no newline yet");
        assert!(drain_events(&mut rx).is_empty());
        let full = state.complete();
        assert_eq!(full, "no newline yet");
        assert_eq!(
            drain_events(&mut rx),
            vec![
                TerminalEvent::Line("no newline yet".into()),
                TerminalEvent::Completed("no newline yet".into()),
                TerminalEvent::Continue,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_prompt_does_not_rearm_flush_immediately() {
        let (mut state, mut rx) = new_state(0, &[]);
        state.start();
        state.on_data(b"a\n");
        state.on_data(b"Password: ");
        assert_eq!(drain_events(&mut rx), vec![TerminalEvent::Line("a\n".into())]);

        tokio::time::advance(Duration::from_millis(600)).await;
        state.on_timers();
        assert!(drain_events(&mut rx).is_empty());
        let now = Instant::now();
        assert!(state.next_deadline().is_some_and(|d| d > now));

        state.on_timers();
        assert!(state.next_deadline().is_some_and(|d| d >= now + Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn background_match_stops_listening() {
        let (mut state, mut rx) = new_state(30, &["npm run *"]);
        state.start();
        state.on_data(b"ready on :3000\n");
        assert_eq!(
            drain_events(&mut rx),
            vec![TerminalEvent::BackgroundCommand("npm run dev".into())]
        );
        assert_eq!(state.control.output().full_output(), "ready on :3000\n");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_zero_never_fires() {
        let (mut state, mut rx) = new_state(5, &[]);
        state.start();
        tokio::time::advance(Duration::from_secs(5)).await;
        state.on_timers();
        state.on_timers();
        assert_eq!(
            drain_events(&mut rx),
            vec![TerminalEvent::CommandTimeout("npm run dev".into())]
        );

        let (mut state, mut rx) = new_state(0, &[]);
        state.start();
        assert!(state.next_deadline().is_none());
        tokio::time::advance(Duration::from_secs(3600)).await;
        state.on_timers();
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hot_timer_cools_and_stretches_for_compiles() {
        let (mut state, _rx) = new_state(0, &[]);
        state.start();
        state.on_data(b"hello\n");
        assert!(state.control.is_hot());
        tokio::time::advance(Duration::from_secs(2)).await;
        state.on_timers();
        assert!(!state.control.is_hot());

        state.on_data(b"Compiling agent-term v0.1.0\n");
        tokio::time::advance(Duration::from_secs(3)).await;
        state.on_timers();
        assert!(state.control.is_hot());
        tokio::time::advance(Duration::from_secs(12)).await;
        state.on_timers();
        assert!(!state.control.is_hot());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_emits_continue_once_and_silences() {
        let (mut state, mut rx) = new_state(0, &[]);
        state.start();
        state.on_data(b"a\n");
        state.detach();
        state.detach();
        tokio::time::advance(Duration::from_secs(1)).await;
        state.on_data(b"b\n");
        state.complete();
        assert_eq!(
            drain_events(&mut rx),
            vec![TerminalEvent::Line("a\n".into()), TerminalEvent::Continue]
        );
        assert_eq!(state.control.output().drain_all(), "b\n");
    }
}
