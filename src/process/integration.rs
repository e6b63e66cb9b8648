//! Contract of the editor shell-integration layer. The host application
//! implements these traits; the engine only consumes them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::events::ExitDetails;

/// A "shell execution complete" notification for one (sub-)command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCompletion {
    pub exit: ExitDetails,
    /// The command line the shell reports for this completion, when known.
    pub command_line: Option<String>,
}

/// One command handed to an integrated shell.
#[derive(Debug)]
pub struct ShellExecution {
    /// Raw terminal data, including integration markers.
    pub data: mpsc::Receiver<Vec<u8>>,
    /// Completion notifications, one per sub-command the shell executed.
    pub completions: mpsc::Receiver<ShellCompletion>,
}

#[async_trait]
pub trait IntegrationShell: Send + Sync + std::fmt::Debug {
    async fn execute(&self, command: &str) -> Result<ShellExecution, AppError>;

    /// Sends Ctrl-C to the shell.
    async fn send_interrupt(&self) -> Result<(), AppError>;

    /// Pid of the shell process, if the host knows it.
    fn pid(&self) -> Option<u32>;

    /// Current working directory as reported by the shell.
    fn cwd(&self) -> Option<PathBuf> {
        None
    }

    async fn dispose(&self);
}

/// Opens one integrated shell per terminal.
pub trait IntegrationProvider: Send + Sync + std::fmt::Debug {
    fn open_shell(&self, cwd: &Path, terminal_id: u32) -> Result<Arc<dyn IntegrationShell>, AppError>;
}
