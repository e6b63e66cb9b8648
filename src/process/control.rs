use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::process::handle::ProcessHandle;
use crate::process::output::OutputStream;

/// State shared between a running command process and the caller's handle.
#[derive(Debug)]
pub struct RunControl {
    command: String,
    output: Mutex<OutputStream>,
    listening: AtomicBool,
    hot: AtomicBool,
    aborted: AtomicBool,
    pub(crate) abort_requested: Notify,
    pub(crate) detach_requested: Notify,
    pub(crate) stop_requested: Notify,
    kill_attempted: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    handle: Mutex<Option<Arc<ProcessHandle>>>,
}

impl RunControl {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            output: Mutex::new(OutputStream::new()),
            listening: AtomicBool::new(true),
            hot: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_requested: Notify::new(),
            detach_requested: Notify::new(),
            stop_requested: Notify::new(),
            kill_attempted: watch::channel(false).0,
            finished: watch::channel(false).0,
            handle: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&self) -> MutexGuard<'_, OutputStream> {
        self.output.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::SeqCst)
    }

    pub(crate) fn set_hot(&self, hot: bool) {
        self.hot.store(hot, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Flags the run as aborted. Returns false when it already was.
    pub(crate) fn mark_aborted(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub(crate) fn mark_finished(&self) {
        self.set_hot(false);
        self.finished.send_replace(true);
    }

    pub(crate) fn mark_kill_attempted(&self) {
        self.kill_attempted.send_replace(true);
    }

    pub fn handle(&self) -> Option<Arc<ProcessHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_handle(&self, handle: Arc<ProcessHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Requests cancellation and resolves once the kill sequence was attempted
    /// (or the run finished). Safe to call repeatedly and after completion.
    pub async fn abort(&self) {
        if self.is_finished() {
            return;
        }
        if self.mark_aborted() {
            info!(command = %self.command, "Abort requested");
            self.abort_requested.notify_one();
        }
        self.wait_kill_attempted_or_finished().await;
    }

    /// Resolves once a kill was attempted or the run finished, whichever comes first.
    pub(crate) async fn wait_kill_attempted_or_finished(&self) {
        let mut attempted = self.kill_attempted.subscribe();
        let mut finished = self.finished.subscribe();
        tokio::select! {
            _ = attempted.wait_for(|v| *v) => {}
            _ = finished.wait_for(|v| *v) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn kill_wait_resolves_on_either_signal() {
        let control = Arc::new(RunControl::new("true"));
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_kill_attempted_or_finished().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        control.mark_kill_attempted();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let control = RunControl::new("true");
        control.mark_finished();
        control.wait_kill_attempted_or_finished().await;
        assert!(control.is_finished());
    }

    #[test]
    fn abort_flag_flips_once() {
        let control = RunControl::new("true");
        assert!(control.mark_aborted());
        assert!(!control.mark_aborted());
        assert!(control.is_aborted());
    }
}
