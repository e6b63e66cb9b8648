use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::process::integration::IntegrationProvider;
use crate::terminal::{ProviderKind, Terminal, TerminalInfo};
use crate::utils::path_utils::{normalize_cwd, same_cwd};

/// Output a detached or backgrounded command produced since it was last read.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundOutput {
    pub terminal_id: u32,
    pub command: String,
    pub running: bool,
    pub output: String,
}

/// Pool of terminals keyed by owner (a task or session) and working directory.
#[derive(Debug)]
pub struct TerminalRegistry {
    config: Arc<Config>,
    provider: Option<Arc<dyn IntegrationProvider>>,
    terminals: Mutex<Vec<Terminal>>,
    next_id: AtomicU32,
}

impl TerminalRegistry {
    /// Registry that only creates spawned terminals.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            provider: None,
            terminals: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Registry that prefers integrated terminals and falls back to spawned
    /// ones when a shell cannot be opened.
    pub fn with_integration(config: Arc<Config>, provider: Arc<dyn IntegrationProvider>) -> Self {
        Self {
            provider: Some(provider),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn terminals(&self) -> MutexGuard<'_, Vec<Terminal>> {
        self.terminals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns an idle terminal for `owner` in `cwd`: the owner's own first,
    /// then an unowned one, otherwise a new terminal. The choice and the
    /// ownership change happen under one lock.
    #[instrument(skip(self, cwd), fields(cwd = %cwd.display()))]
    pub fn acquire(&self, cwd: &Path, owner: &str) -> Result<Terminal, AppError> {
        let cwd = normalize_cwd(cwd)?;
        if !cwd.is_dir() {
            return Err(AppError::InvalidPath(format!("Working directory does not exist: {}", cwd.display())));
        }
        let mut terminals = self.terminals();
        terminals.retain(|t| !t.is_closed());

        if let Some(terminal) = terminals
            .iter()
            .find(|t| t.owner().as_deref() == Some(owner) && t.is_available() && same_cwd(&t.cwd(), &cwd))
        {
            debug!(terminal_id = terminal.id(), "Reusing owner's terminal");
            return Ok(terminal.clone());
        }

        if let Some(terminal) = terminals
            .iter()
            .find(|t| t.owner().is_none() && t.is_available() && same_cwd(&t.cwd(), &cwd))
        {
            debug!(terminal_id = terminal.id(), "Adopting pooled terminal");
            terminal.set_owner(Some(owner));
            return Ok(terminal.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let terminal = self.create_terminal(id, cwd);
        terminal.set_owner(Some(owner));
        info!(terminal_id = id, kind = ?terminal.kind(), "Created terminal");
        terminals.push(terminal.clone());
        Ok(terminal)
    }

    fn create_terminal(&self, id: u32, cwd: std::path::PathBuf) -> Terminal {
        let config = Arc::clone(&self.config);
        if let Some(provider) = &self.provider {
            match provider.open_shell(&cwd, id) {
                Ok(shell) => return Terminal::new_integrated(id, cwd, config, shell),
                Err(e) => warn!(terminal_id = id, error = %e, "Shell integration unavailable, using a spawned terminal"),
            }
        }
        Terminal::new_spawned(id, cwd, config)
    }

    pub fn get(&self, id: u32) -> Option<Terminal> {
        self.terminals().iter().find(|t| t.id() == id).cloned()
    }

    pub fn terminals_for(&self, owner: &str) -> Vec<Terminal> {
        self.terminals()
            .iter()
            .filter(|t| t.owner().as_deref() == Some(owner))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        self.terminals().iter().map(Terminal::info).collect()
    }

    /// Drains output that `owner`'s commands produced after their caller
    /// stopped listening.
    pub fn background_output(&self, owner: &str) -> Vec<BackgroundOutput> {
        self.terminals_for(owner)
            .into_iter()
            .filter_map(|terminal| {
                let control = terminal.last_run()?;
                if control.is_listening() || !control.output().has_unretrieved() {
                    return None;
                }
                Some(BackgroundOutput {
                    terminal_id: terminal.id(),
                    command: control.command().to_string(),
                    running: !control.is_finished(),
                    output: terminal.unretrieved_output().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Releases everything `owner` holds: running commands are aborted,
    /// integrated shells are disposed and spawned terminals return to the pool.
    #[instrument(skip(self))]
    pub async fn release(&self, owner: &str) {
        let owned = self.terminals_for(owner);
        for terminal in &owned {
            if terminal.is_busy() {
                terminal.abort().await;
            }
            if terminal.kind() == ProviderKind::Integrated {
                terminal.close().await;
            }
            terminal.set_owner(None);
        }
        self.terminals().retain(|t| !t.is_closed());
        info!(released = owned.len(), "Released terminals");
    }

    /// Aborts every running command and disposes every terminal.
    pub async fn shutdown(&self) {
        let all: Vec<Terminal> = std::mem::take(&mut *self.terminals());
        for terminal in &all {
            if terminal.is_busy() {
                terminal.abort().await;
            }
            terminal.close().await;
        }
        info!(count = all.len(), "Terminal registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::integration::IntegrationShell;
    use crate::terminal::RunOptions;

    #[derive(Debug)]
    struct NoShells;

    impl IntegrationProvider for NoShells {
        fn open_shell(&self, _cwd: &Path, _terminal_id: u32) -> Result<Arc<dyn IntegrationShell>, AppError> {
            Err(AppError::IntegrationError("shell integration not active".into()))
        }
    }

    fn registry() -> TerminalRegistry {
        TerminalRegistry::new(Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn reuses_owner_terminal_for_same_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let first = registry.acquire(dir.path(), "task-1").unwrap();
        let again = registry.acquire(dir.path(), "task-1").unwrap();
        assert_eq!(first.id(), again.id());

        let other = registry.acquire(dir.path(), "task-2").unwrap();
        assert_ne!(first.id(), other.id());
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn different_cwd_gets_new_terminal() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = registry();
        let first = registry.acquire(a.path(), "task").unwrap();
        let second = registry.acquire(b.path(), "task").unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn released_terminals_return_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let first = registry.acquire(dir.path(), "task-1").unwrap();
        registry.release("task-1").await;
        assert_eq!(first.owner(), None);

        let adopted = registry.acquire(dir.path(), "task-2").unwrap();
        assert_eq!(adopted.id(), first.id());
        assert_eq!(adopted.owner().as_deref(), Some("task-2"));
    }

    #[tokio::test]
    async fn falls_back_to_spawned_without_integration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TerminalRegistry::with_integration(Arc::new(Config::default()), Arc::new(NoShells));
        let terminal = registry.acquire(dir.path(), "task").unwrap();
        assert_eq!(terminal.kind(), ProviderKind::Spawned);
    }

    #[tokio::test]
    async fn missing_cwd_is_rejected() {
        let registry = registry();
        let err = registry.acquire(Path::new("/definitely/not/here/agent-term"), "task");
        assert!(matches!(err, Err(AppError::InvalidPath(_))));
        assert!(registry.list().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_terminal_is_not_handed_out_again() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let terminal = registry.acquire(dir.path(), "task").unwrap();
        let mut run = terminal.run("sleep 30", RunOptions::default()).unwrap();

        let second = registry.acquire(dir.path(), "task").unwrap();
        assert_ne!(second.id(), terminal.id());

        registry.release("task").await;
        let outcome = run.outcome().await;
        assert!(matches!(outcome, crate::events::RunOutcome::Aborted { .. }));
        assert!(!terminal.is_busy());
    }
}
