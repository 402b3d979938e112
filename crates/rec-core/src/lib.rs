//! # rec-core
//!
//! The Runtime abstraction, command execution, file operations, and the
//! PTY channel for the Remote Execution Core. This crate is transport-
//! agnostic at the type level ([`Runtime`]) but ships exactly two
//! implementations: [`LocalRuntime`] (bare OS process/filesystem APIs)
//! and [`SshRuntime`] (every operation dispatched over a pooled
//! [`rec_ssh::ConnectionPool`] lease). Everything below "dial a host"
//! lives in `rec-ssh`; everything above it — dual timeouts, atomic
//! writes, cancellation, terminals — lives here.
#![warn(missing_docs)]

pub mod cancel;
pub mod error;
pub mod exec;
pub mod fs;
pub mod local;
pub mod runtime;
pub mod ssh;
pub mod terminal;

pub use cancel::{CancelScope, REMOTE_KILL_GRACE};
pub use error::{FilesystemError, RecError};
pub use exec::{ExecRequest, ExecResult, ExecStreams};
pub use fs::{DirEntry, FileKind, FileStat};
pub use local::LocalRuntime;
pub use runtime::{HealthCheckResult, Runtime, RuntimeStatus};
pub use ssh::SshRuntime;
pub use terminal::{Terminal, TerminalOptions, TerminalSignal};
