//! The SSH-backed Runtime: composes a [`rec_ssh::ConnectionPool`] lease
//! per operation and dispatches everything as a quoted POSIX command
//! string over it

use crate::error::RecError;
use crate::exec::{self, ExecRequest, ExecResult, ExecStreams};
use crate::fs::{self, DirEntry, FileStat};
use crate::runtime::{HealthCheckResult, Runtime, RuntimeStatus};
use crate::terminal::{self, Terminal, TerminalOptions};
use async_trait::async_trait;
use rec_ssh::{AcquireOptions, ConnectionPool, HealthSignal, HostConfig, PoolConfig, PoolKey};
use std::process::Output;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// How long to wait for a lease before giving up, for non-interactive
/// file/exec operations. Generous relative to the pool's own probe
/// timeout, since a caller waiting here is usually also willing to
/// wait out a re-probe.
const ACQUIRE_WAIT: Duration = Duration::from_secs(10);

/// How long `echo "$HOME"` is allowed to take during `initialize`
const HOME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a single file operation (stat/read/write/mkdir/remove/list)
/// is allowed to take before the runtime gives up and reports a
/// transport failure.
const FS_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Map a remote `ssh` invocation's exit status to a [`HealthSignal`],
/// for the non-streaming file operations. Narrower than
/// [`exec::build_remote_command`]'s callers need — these commands are
/// never wrapped in `timeout -s KILL`, so 124/137 carry no special
/// meaning here, same spirit as `classify_remote_exit` but without the
/// `Timeout` row.
fn signal_for_exit(code: Option<i32>) -> HealthSignal {
    match code {
        Some(0) => HealthSignal::Success,
        Some(255) | None => HealthSignal::Transport,
        Some(_) => HealthSignal::CommandFailure,
    }
}

/// Runs commands and touches files on a single pooled SSH host. Every
/// operation acquires a lease, runs a shell command over it, and
/// reports the outcome back to the pool's health model before
/// releasing the lease.
pub struct SshRuntime {
    pool: ConnectionPool,
    key: PoolKey,
    host_config: HostConfig,
    owns_pool: bool,
    home: OnceCell<String>,
    status: RwLock<RuntimeStatus>,
}

impl SshRuntime {
    /// Construct a runtime with its own private connection pool
    pub fn new(host_config: HostConfig, pool_config: PoolConfig) -> Self {
        let key = host_config.pool_key();
        Self {
            pool: ConnectionPool::new(pool_config),
            key,
            host_config,
            owns_pool: true,
            home: OnceCell::new(),
            status: RwLock::new(RuntimeStatus::Initializing),
        }
    }

    /// Construct a runtime riding an existing pool shared with other
    /// `SshRuntime`s (and their reaper), e.g. one pool per process with
    /// one runtime per session.
    pub fn with_pool(pool: ConnectionPool, host_config: HostConfig) -> Self {
        let key = host_config.pool_key();
        Self {
            pool,
            key,
            host_config,
            owns_pool: false,
            home: OnceCell::new(),
            status: RwLock::new(RuntimeStatus::Initializing),
        }
    }

    fn set_status(&self, status: RuntimeStatus) {
        *self.status.write().unwrap() = status;
    }

    async fn home_dir(&self) -> Result<String, RecError> {
        self.home
            .get_or_try_init(|| async {
                let output = self
                    .run_remote("echo \"$HOME\"".to_string(), None, HOME_LOOKUP_TIMEOUT)
                    .await?;
                Ok::<String, RecError>(String::from_utf8_lossy(&output.stdout).trim().to_string())
            })
            .await
            .cloned()
    }

    /// Substitute a leading `~` or `~/` in `path` with the cached
    /// `$HOME`, per-Runtime, looked up once in [`Self::home_dir`]. Every
    /// file operation routes its path through here before building the
    /// remote shell command, since the command is POSIX-quoted and the
    /// remote shell never sees an unquoted `~` to expand itself.
    async fn expand_path(&self, path: &str) -> Result<String, RecError> {
        if path == "~" {
            self.home_dir().await
        } else if let Some(rest) = path.strip_prefix("~/") {
            Ok(format!("{}/{rest}", self.home_dir().await?))
        } else {
            Ok(path.to_string())
        }
    }

    /// Acquire a lease, run one non-streaming command to completion,
    /// and report its outcome to the pool's health model.
    async fn run_remote(
        &self,
        command: String,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Output, RecError> {
        let lease = self
            .pool
            .acquire(&self.key, AcquireOptions { max_wait: ACQUIRE_WAIT })
            .await
            .map_err(|e| {
                self.set_status(RuntimeStatus::Disconnected(e.to_string()));
                RecError::Transport {
                    pool_key: self.key.to_string(),
                    message: e.to_string(),
                }
            })?;

        let mut child = lease.connection().spawn_command(&command).map_err(|e| {
            RecError::Transport {
                pool_key: self.key.to_string(),
                message: e.to_string(),
            }
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut sin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                let _ = sin.write_all(&bytes).await;
            }
        } else {
            drop(child.stdin.take());
        }

        let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.pool
                    .report(&self.key, HealthSignal::Transport, Some(e.to_string()))
                    .await;
                return Err(RecError::Transport {
                    pool_key: self.key.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                self.pool
                    .report(
                        &self.key,
                        HealthSignal::Transport,
                        Some("remote command timed out".to_string()),
                    )
                    .await;
                return Err(RecError::Timeout);
            }
        };

        let signal = signal_for_exit(output.status.code());
        if signal == HealthSignal::Transport {
            self.set_status(RuntimeStatus::Disconnected(
                "remote command exited with ssh's own error code (255)".to_string(),
            ));
        }
        self.pool.report(&self.key, signal, None).await;
        drop(lease);
        Ok(output)
    }
}

#[async_trait]
impl Runtime for SshRuntime {
    async fn initialize(&self) -> Result<(), RecError> {
        self.pool
            .add_host(self.host_config.clone())
            .await
            .map_err(|e| RecError::Configuration(e.to_string()))?;
        if self.owns_pool {
            self.pool.start();
        }
        let home = self.home_dir().await?;
        debug!(home, target = %self.key, "ssh runtime initialized");
        self.set_status(RuntimeStatus::Ready);
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthCheckResult, RecError> {
        let start = std::time::Instant::now();
        let output = self
            .run_remote("echo ok".to_string(), None, Duration::from_secs(5))
            .await?;
        let healthy =
            output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "ok";
        Ok(HealthCheckResult {
            healthy,
            latency: Some(start.elapsed()),
        })
    }

    async fn exec(
        &self,
        request: ExecRequest,
    ) -> Result<(ExecStreams, tokio::task::JoinHandle<Result<ExecResult, RecError>>), RecError>
    {
        let mut request = request;
        request.working_dir = Some(match request.working_dir.take() {
            Some(dir) => self.expand_path(&dir).await?,
            None => self.home_dir().await?,
        });

        let lease = self
            .pool
            .acquire(&self.key, AcquireOptions { max_wait: ACQUIRE_WAIT })
            .await
            .map_err(|e| RecError::Transport {
                pool_key: self.key.to_string(),
                message: e.to_string(),
            })?;

        let remote_command = exec::build_remote_command(&request);
        let child = lease
            .connection()
            .spawn_command(&remote_command)
            .map_err(|e| RecError::Transport {
                pool_key: self.key.to_string(),
                message: e.to_string(),
            })?;

        let (streams, handle) = exec::drive(child, &request, false).await;

        let pool = self.pool.clone();
        let key = self.key.clone();
        let wrapped = tokio::spawn(async move {
            let result = handle
                .await
                .map_err(|e| RecError::Configuration(e.to_string()))?;
            if let Ok(outcome) = &result {
                pool.report(&key, outcome.health_signal, None).await;
            }
            drop(lease);
            result
        });

        Ok((streams, wrapped))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RecError> {
        let real = self.expand_path(path).await?;
        let output = self
            .run_remote(fs::read_command(&real), None, FS_OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        Ok(output.stdout)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), RecError> {
        let real = self.expand_path(path).await?;
        let suffix = uuid::Uuid::new_v4().to_string();
        let output = self
            .run_remote(
                fs::atomic_write_command(&real, &suffix),
                Some(content.to_vec()),
                FS_OP_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileStat, RecError> {
        let real = self.expand_path(path).await?;
        let output = self
            .run_remote(fs::stat_command(&real), None, FS_OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        let line = String::from_utf8_lossy(&output.stdout);
        fs::parse_stat_line(&line).ok_or_else(|| {
            RecError::Configuration(format!("unparseable stat output for {path}: {line}"))
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, RecError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(RecError::Filesystem(crate::error::FilesystemError::NotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RecError> {
        let real = self.expand_path(path).await?;
        let output = self
            .run_remote(fs::mkdir_command(&real, recursive), None, FS_OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), RecError> {
        let real = self.expand_path(path).await?;
        let output = self
            .run_remote(fs::remove_command(&real, recursive), None, FS_OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, RecError> {
        let real = self.expand_path(path).await?;
        let output = self
            .run_remote(fs::list_command(&real), None, FS_OP_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fs::classify_fs_error(path, &stderr).into());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().filter_map(fs::parse_list_line).collect())
    }

    async fn open_terminal(&self, options: TerminalOptions) -> Result<Terminal, RecError> {
        let lease = self
            .pool
            .acquire(&self.key, AcquireOptions { max_wait: ACQUIRE_WAIT })
            .await
            .map_err(|e| RecError::Transport {
                pool_key: self.key.to_string(),
                message: e.to_string(),
            })?;

        let cwd = match &options.cwd {
            Some(cwd) => self.expand_path(cwd).await?,
            None => self.home_dir().await?,
        };
        let remote_shell = format!(
            "cd {} 2>/dev/null; exec \"${{SHELL:-/bin/sh}}\" -l",
            exec::posix_quote(&cwd)
        );
        let args = lease.connection().pty_args(&remote_shell);

        terminal::spawn_terminal("ssh", &args, options, Some(Box::new(lease)))
            .map_err(|e| RecError::Configuration(e.to_string()))
    }

    fn status(&self) -> RuntimeStatus {
        self.status.read().unwrap().clone()
    }

    async fn dispose(&self) {
        debug!(target = %self.key, "disposing ssh runtime");
        if self.owns_pool {
            self.pool.shutdown().await;
        }
        self.set_status(RuntimeStatus::Disposed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_for_exit_maps_known_codes() {
        assert_eq!(signal_for_exit(Some(0)), HealthSignal::Success);
        assert_eq!(signal_for_exit(Some(255)), HealthSignal::Transport);
        assert_eq!(signal_for_exit(None), HealthSignal::Transport);
        assert_eq!(signal_for_exit(Some(1)), HealthSignal::CommandFailure);
    }

    #[test]
    fn new_derives_pool_key_from_host_config() {
        let runtime = SshRuntime::new(HostConfig::new("example.com"), PoolConfig::default());
        assert_eq!(runtime.key.to_string(), "default@example.com:22");
        assert_eq!(runtime.status(), RuntimeStatus::Initializing);
    }
}
