//! The Runtime abstraction: one capability set, two implementations
//! (`LocalRuntime`, `SshRuntime`)

use crate::exec::{ExecRequest, ExecResult, ExecStreams};
use crate::error::RecError;
use crate::fs::{DirEntry, FileStat};
use crate::terminal::{Terminal, TerminalOptions};
use async_trait::async_trait;
use std::time::Duration;

/// A Runtime's current state. `Disposed` is terminal: once reached, no
/// other status is ever observed again for that Runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// `Initialize` has not completed yet
    Initializing,
    /// Ready to accept operations
    Ready,
    /// `n` operations are currently in flight
    Busy(u32),
    /// The runtime hit an error; `recoverable` indicates whether a
    /// caller might retry without disposing it
    Error {
        /// Whether a retry might succeed without a fresh Runtime
        recoverable: bool,
    },
    /// The underlying connection dropped; `reason` is a short
    /// human-readable description
    Disconnected(String),
    /// `Dispose` has completed; terminal
    Disposed,
}

/// The result of [`Runtime::health_check`]
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckResult {
    /// Whether `echo ok` round-tripped within the health-check timeout
    pub healthy: bool,
    /// Observed latency, if the check completed
    pub latency: Option<Duration>,
}

/// Uniform interface over local process execution and SSH execution.
/// A Runtime owns exactly one target — one local environment, or one
/// pooled SSH host — for its lifetime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Idempotent setup: for SSH, verifies the working directory
    /// exists and caches `$HOME`; for Local, verifies the working
    /// directory is a directory.
    async fn initialize(&self) -> Result<(), RecError>;

    /// Run `echo ok` with a 5s local timeout and report round-trip
    /// latency.
    async fn health_check(&self) -> Result<HealthCheckResult, RecError>;

    /// Run a command, returning its streamed output and a handle that
    /// resolves to the final [`ExecResult`] once the process exits.
    async fn exec(
        &self,
        request: ExecRequest,
    ) -> Result<(ExecStreams, tokio::task::JoinHandle<Result<ExecResult, RecError>>), RecError>;

    /// Read a file's entire contents
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RecError>;

    /// Atomically replace a file's contents
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), RecError>;

    /// Stat a path, following symlinks
    async fn stat(&self, path: &str) -> Result<FileStat, RecError>;

    /// True iff `stat` succeeds with any kind
    async fn exists(&self, path: &str) -> Result<bool, RecError>;

    /// Create a directory; `recursive` also creates parents
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RecError>;

    /// Delete a file or, if `recursive`, a directory tree
    async fn remove(&self, path: &str, recursive: bool) -> Result<(), RecError>;

    /// List one directory's entries
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, RecError>;

    /// Open an interactive PTY session
    async fn open_terminal(&self, options: TerminalOptions) -> Result<Terminal, RecError>;

    /// Current status
    fn status(&self) -> RuntimeStatus;

    /// Cancel in-flight operations with a deterministic error, close
    /// terminals, release the pool lease. Idempotent.
    async fn dispose(&self);
}
