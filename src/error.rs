use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0:#}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Failed to spawn command: {0}")]
    SpawnError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Terminal {0} is busy")]
    TerminalBusy(u32),

    #[error("Terminal {0} has been closed")]
    TerminalClosed(u32),

    #[error("Shell integration error: {0}")]
    IntegrationError(String),
}

impl AppError {
    /// Admission errors are the only failures a caller sees before a run exists.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            AppError::TerminalBusy(_) | AppError::TerminalClosed(_) | AppError::CommandBlocked(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn only_admission_failures_are_admission_errors() {
        assert!(AppError::TerminalBusy(1).is_admission());
        assert!(AppError::TerminalClosed(1).is_admission());
        assert!(AppError::CommandBlocked("rm -rf /".into()).is_admission());
        assert!(!AppError::SpawnError("'ls': not found".into()).is_admission());
        assert!(!AppError::ProcessError("wait failed".into()).is_admission());
    }

    #[test]
    fn config_errors_keep_their_context_chain() {
        let source: anyhow::Result<()> = Err(anyhow::anyhow!("DEFAULT_CWD is not a valid directory"));
        let err: AppError = source.context("Failed to load configuration").unwrap_err().into();
        assert!(matches!(err, AppError::ConfigError(_)));
        let message = err.to_string();
        assert!(message.starts_with("Configuration error: Failed to load configuration"));
        assert!(message.contains("DEFAULT_CWD is not a valid directory"));
    }

    #[test]
    fn spawn_errors_name_the_command() {
        let err = AppError::SpawnError("'npm run dev': No such file or directory".into());
        assert_eq!(err.to_string(), "Failed to spawn command: 'npm run dev': No such file or directory");
    }
}
