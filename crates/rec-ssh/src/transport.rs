//! Raw `ssh` subprocess transport
//!
//! This crate does not parse the SSH protocol itself: it shells out
//! to the OS `ssh` client and leans on OpenSSH's own
//! connection multiplexing (`ControlMaster`) to keep a single
//! authenticated socket alive underneath many short-lived command
//! invocations. One [`Connection`] corresponds to one `ControlMaster`
//! socket; each stream riding it is its own `ssh -S <path>` subprocess.

use crate::config::HostConfig;
use crate::error::TransportError;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 15;
const SERVER_ALIVE_INTERVAL_SECS: u64 = 5;
const SERVER_ALIVE_COUNT_MAX: u64 = 2;
const CONTROL_PERSIST_SECS: u64 = 60;

/// Build the ControlPath for a pool key: a short hash placed in a
/// private per-user directory, kept stable for the process lifetime.
pub fn control_path_for(pool_key_repr: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    pool_key_repr.hash(&mut hasher);
    let digest = hasher.finish();
    let mut dir = std::env::temp_dir();
    dir.push("rec-ssh-control");
    dir.push(format!("{digest:016x}.sock"));
    dir
}

/// Build the base `ssh` client option list shared by the control-master
/// dial and every per-command invocation riding it.
fn base_ssh_args(config: &HostConfig, control_path: &PathBuf) -> Vec<String> {
    let mut args = vec![
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
        "-o".into(),
        format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
        "-o".into(),
        format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
        "-o".into(),
        "ControlMaster=auto".into(),
        "-o".into(),
        format!("ControlPersist={CONTROL_PERSIST_SECS}"),
        "-o".into(),
        format!("ControlPath={}", control_path.display()),
        "-p".into(),
        config.effective_port().to_string(),
    ];

    match config.host_key_policy {
        crate::config::HostKeyPolicy::System => {}
        crate::config::HostKeyPolicy::Permissive => {
            args.push("-o".into());
            args.push("StrictHostKeyChecking=no".into());
            args.push("-o".into());
            args.push("UserKnownHostsFile=/dev/null".into());
        }
    }

    if let Some(key) = &config.identity_file {
        args.push("-i".into());
        args.push(key.to_string_lossy().to_string());
    }

    for (key, value) in &config.extra_options {
        args.push("-o".into());
        args.push(format!("{key}={value}"));
    }

    args
}

fn target_string(config: &HostConfig) -> String {
    let user = config
        .username
        .clone()
        .or_else(|| {
            config
                .host
                .find('@')
                .map(|idx| config.host[..idx].to_string())
        });
    let host = match config.host.find('@') {
        Some(idx) => &config.host[idx + 1..],
        None => config.host.as_str(),
    };
    match user {
        Some(u) => format!("{u}@{host}"),
        None => host.to_string(),
    }
}

/// One live SSH connection: a `ControlMaster` socket plus the
/// background process keeping it open.
#[derive(Debug)]
pub struct Connection {
    config: HostConfig,
    control_path: PathBuf,
    master: Mutex<Option<Child>>,
    created_at: Instant,
    last_used_at: AtomicI64,
    epoch: Instant,
    active_streams: AtomicUsize,
    closed: AtomicBool,
}

impl Connection {
    fn new(config: HostConfig, control_path: PathBuf, master: Child, now: Instant) -> Self {
        Self {
            config,
            control_path,
            master: Mutex::new(Some(master)),
            created_at: now,
            last_used_at: AtomicI64::new(0),
            epoch: now,
            active_streams: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// When this connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When a stream was last acquired from this connection
    pub fn last_used_at(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_used_at.load(Ordering::SeqCst).max(0) as u64)
    }

    fn touch(&self, now: Instant) {
        let millis = now.duration_since(self.epoch).as_millis() as i64;
        self.last_used_at.fetch_max(millis, Ordering::SeqCst);
    }

    /// Current number of streams riding this connection
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Whether this connection has been closed; once true, never false
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn a command riding this connection's control socket. The
    /// caller owns the resulting `Child` and is responsible for driving
    /// its stdio and waiting on it (see `rec-core::exec`).
    pub fn spawn_command(&self, remote_command: &str) -> Result<Child, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Connection(
                "connection is closed".to_string(),
            ));
        }
        let mut args = base_ssh_args(&self.config, &self.control_path);
        args.push(target_string(&self.config));
        args.push(remote_command.to_string());

        debug!(args = ?args, "spawning ssh command over control socket");

        Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Io(e))
    }

    /// The `ssh` argument list for a forced-PTY invocation of
    /// `remote_command`, for callers (the terminal channel) that need
    /// to run `ssh` inside a locally-allocated pty rather than a plain
    /// pipe, so that OpenSSH forwards window-change signals.
    pub fn pty_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = base_ssh_args(&self.config, &self.control_path);
        args.push("-tt".into());
        args.push(target_string(&self.config));
        args.push(remote_command.to_string());
        args
    }

    /// Close the control master, tearing down the multiplexed socket.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing ssh connection");

        let mut args = base_ssh_args(&self.config, &self.control_path);
        args.push("-O".into());
        args.push("exit".into());
        args.push(target_string(&self.config));
        let _ = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let master = self.master.lock().unwrap().take();
        if let Some(mut child) = master {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill control-master process: {e}");
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}

/// RAII guard returned by [`StreamGuard::new`]; decrements
/// `active_streams` exactly once on drop.
pub struct StreamGuard {
    connection: std::sync::Arc<Connection>,
}

impl StreamGuard {
    /// Reserve a stream slot on `connection`, bumping `active_streams`
    /// and the last-used timestamp. Takes an `Arc` explicitly rather
    /// than as a receiver, since a bare `&Arc<Connection>` self type
    /// isn't available on stable.
    pub fn new(connection: std::sync::Arc<Connection>, now: Instant) -> Self {
        connection.active_streams.fetch_add(1, Ordering::SeqCst);
        connection.touch(now);
        Self { connection }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.connection.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dials a fresh [`Connection`] for `config` by establishing the
/// `ControlMaster` socket and confirming it is reachable.
pub async fn dial(config: &HostConfig, now: Instant) -> Result<Connection, TransportError> {
    let control_path = control_path_for(&config.pool_key().to_string());
    if let Some(parent) = control_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(TransportError::Io)?;
    }

    info!(target = %target_string(config), "dialing ssh control master");

    let mut args = base_ssh_args(config, &control_path);
    args.push("-M".into());
    args.push("-N".into());
    args.push("-f".into());
    args.push(target_string(config));

    let master = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TransportError::Io)?;

    // `-f` backgrounds the real master once authenticated; the Child
    // handle here tracks the short-lived parent that forked it. We keep
    // it only so Drop has something to reap; the socket itself is what
    // matters and is checked below.
    let check_args = {
        let mut a = base_ssh_args(config, &control_path);
        a.push("-O".into());
        a.push("check".into());
        a.push(target_string(config));
        a
    };

    let mut last_failure = None;
    for _ in 0..10 {
        let output = Command::new("ssh")
            .args(&check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(TransportError::Io)?;

        if output.status.success() {
            return Ok(Connection::new(config.clone(), control_path, master, now));
        }
        last_failure = Some((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (code, message) = last_failure.unwrap_or((-1, "control master failed to come up".into()));
    Err(TransportError::CommandFailed { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    #[test]
    fn control_path_is_stable_for_same_key() {
        let a = control_path_for("alice@example.com:22");
        let b = control_path_for("alice@example.com:22");
        assert_eq!(a, b);
    }

    #[test]
    fn control_path_differs_by_key() {
        let a = control_path_for("alice@example.com:22");
        let b = control_path_for("bob@example.com:22");
        assert_ne!(a, b);
    }

    #[test]
    fn base_args_include_required_ssh_options() {
        let config = HostConfig::new("example.com");
        let path = control_path_for(&config.pool_key().to_string());
        let args = base_ssh_args(&config, &path);
        let joined = args.join(" ");
        assert!(joined.contains("ControlMaster=auto"));
        assert!(joined.contains("ControlPersist=60"));
        assert!(joined.contains("ConnectTimeout=15"));
        assert!(joined.contains("ServerAliveInterval=5"));
        assert!(joined.contains("ServerAliveCountMax=2"));
    }

    #[test]
    fn target_string_combines_user_and_host() {
        let cfg = HostConfig::new("alice@example.com");
        assert_eq!(target_string(&cfg), "alice@example.com");
    }

    #[test]
    fn target_string_uses_username_override() {
        let mut cfg = HostConfig::new("example.com");
        cfg.username = Some("bob".to_string());
        assert_eq!(target_string(&cfg), "bob@example.com");
    }
}
