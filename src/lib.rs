//! Command execution engine for agent terminals: runs shell commands in
//! pooled terminals, streams their output, tracks compound commands and
//! background processes, and tears down process trees on abort.

pub mod config;
pub mod error;
pub mod events;
pub mod process;
pub mod terminal;
pub mod utils;

pub use config::{Config, EngineTimings};
pub use error::AppError;
pub use events::{ExitDetails, RunOutcome, TerminalEvent, UNKNOWN_EXIT_CODE};
pub use process::{IntegrationProvider, IntegrationShell, ProcessHandle, ShellCompletion, ShellExecution};
pub use terminal::{
    ProviderKind, RunHandle, RunOptions, Settled, Terminal, TerminalInfo, TerminalRegistry,
};
