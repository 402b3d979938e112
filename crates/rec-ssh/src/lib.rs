//! # rec-ssh
//!
//! SSH connection pooling, health tracking, and subprocess transport for
//! the Remote Execution Core. This crate owns everything below the
//! "one authenticated, multiplexed connection per host" line: dialing
//! `ssh` control masters, probing and backing off unhealthy hosts, and
//! handing out leases that downstream command/file/terminal operations
//! ride.
//!
//! It does not parse the SSH wire protocol, manage keys, or know
//! anything about what gets run over a connection — that's `rec-core`.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod pool;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_host_configs, HostConfig, HostKeyPolicy, PoolKey};
pub use error::{ConfigError, PoolError, TransportError};
pub use health::{Health, HealthSignal, HealthStatus};
pub use pool::{AcquireOptions, ConnectionPool, HealthSnapshot, Lease, PoolConfig, PoolStats};
pub use transport::Connection;
