//! The top-level error taxonomy callers see from a [`crate::Runtime`]
//!
//! `CommandFailure` deliberately has no variant here: a non-zero exit
//! from the user's command is not an error, it is a successful
//! [`crate::exec::ExecResult`] carrying that exit code.

use rec_ssh::{ConfigError, PoolError, TransportError};
use thiserror::Error;

/// Errors surfaced by Runtime operations
#[derive(Debug, Error)]
pub enum RecError {
    /// Host, port, identity-file, or working-directory configuration is
    /// unusable. Fatal for the affected Runtime only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A TCP/SSH-layer failure: refused, reset, timed out at dial, auth
    /// failure, unexpected disconnect, or exit code 255.
    #[error("transport error against {pool_key}: {message}")]
    Transport {
        /// The pool key of the affected host
        pool_key: String,
        /// A short, human-readable description
        message: String,
    },

    /// The local timer fired before the remote command (or transport)
    /// responded.
    #[error("operation timed out")]
    Timeout,

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// A filesystem-layer failure, independent of transport health
    #[error("filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// The Runtime has been disposed and can no longer be used
    #[error("runtime has been disposed")]
    Disposed,
}

/// Filesystem-specific failure kinds
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilesystemError {
    /// The target path does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation lacked permission to act on the path
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A non-recursive create collided with an existing entry
    #[error("already exists: {0}")]
    Exists(String),

    /// The remote filesystem rejected the write for lack of space
    #[error("no space left on device: {0}")]
    NoSpace(String),

    /// A file operation was attempted against a directory
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A directory operation was attempted against a non-directory
    #[error("not a directory: {0}")]
    NotADirectory(String),
}

impl From<PoolError> for RecError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Configuration(c) => RecError::Configuration(c.to_string()),
            PoolError::PoolClosed => RecError::Disposed,
            PoolError::InBackoff { .. } | PoolError::ProbeFailed(_) => RecError::Transport {
                pool_key: String::new(),
                message: e.to_string(),
            },
            PoolError::Transport(t) => RecError::Transport {
                pool_key: String::new(),
                message: t.to_string(),
            },
        }
    }
}

impl From<TransportError> for RecError {
    fn from(e: TransportError) -> Self {
        RecError::Transport {
            pool_key: String::new(),
            message: e.to_string(),
        }
    }
}

impl From<ConfigError> for RecError {
    fn from(e: ConfigError) -> Self {
        RecError::Configuration(e.to_string())
    }
}
