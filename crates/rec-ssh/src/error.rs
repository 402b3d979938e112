//! Errors surfaced by the transport, pool, and config layers

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors from parsing or validating a [`crate::config::HostConfig`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The host field was empty
    #[error("host must not be empty")]
    EmptyHost,

    /// Port 0 is reserved and cannot be dialed
    #[error("port must be non-zero")]
    ZeroPort,

    /// The identity file path doesn't exist at validation time
    #[error("identity file not found: {0}")]
    IdentityFileMissing(String),

    /// The config file could not be read from disk
    #[error("failed to read config file {path}: {message}")]
    Io {
        /// The path that could not be read
        path: String,
        /// The underlying I/O error's message
        message: String,
    },

    /// The config file's contents were not valid TOML, or didn't match
    /// the expected table shape
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// The path that failed to parse
        path: String,
        /// The underlying parser error's message
        message: String,
    },
}

/// Errors from the raw subprocess transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A control-socket management command (`-O check`, `-O exit`, ...)
    /// exited non-zero
    #[error("ssh control command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed control command
        code: i32,
        /// Captured stderr, if any
        message: String,
    },
}

/// Errors from [`crate::pool::ConnectionPool::acquire`]
#[derive(Debug, Error)]
pub enum PoolError {
    /// The host is in backoff; retryable after `retry_after`
    #[error("host is in backoff for another {retry_after:?}")]
    InBackoff {
        /// How long until the backoff window ends
        retry_after: Duration,
    },

    /// A singleflight probe for this host failed
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// The host configuration is invalid or missing
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The pool has been shut down
    #[error("pool is closed")]
    PoolClosed,

    /// A transport-layer error unrelated to health gating
    #[error(transparent)]
    Transport(#[from] TransportError),
}
