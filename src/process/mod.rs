pub mod control;
pub mod handle;
pub mod integrated;
pub mod integration;
pub mod kill;
pub mod markers;
pub mod output;
pub mod spawned;
pub mod stream;

use async_trait::async_trait;

pub use control::RunControl;
pub use handle::{ExitState, ProcessHandle};
pub use integration::{IntegrationProvider, IntegrationShell, ShellCompletion, ShellExecution};
pub use output::OutputStream;
pub use spawned::ShellSpec;
pub use stream::{ProcessEnd, StreamState};

/// One command's lifecycle. Implementations stream into the given state and
/// return once the command completed, was aborted, or was told to stop.
#[async_trait]
pub trait CommandProcess: Send + std::fmt::Debug {
    async fn run(self: Box<Self>, stream: StreamState) -> ProcessEnd;
}
