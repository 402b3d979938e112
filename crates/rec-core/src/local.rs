//! The local-process Runtime: OS process and filesystem APIs directly,
//! no SSH layer involved

use crate::error::{FilesystemError, RecError};
use crate::exec::{self, ExecRequest, ExecResult, ExecStreams};
use crate::fs::{DirEntry, FileKind, FileStat};
use crate::runtime::{HealthCheckResult, Runtime, RuntimeStatus};
use crate::terminal::{self, Terminal, TerminalOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

/// Runs commands and touches files on the machine the process itself
/// is running on. Its `HealthSignal` is always `Success` or
/// `CommandFailure` — there is no transport to discard.
pub struct LocalRuntime {
    working_dir: PathBuf,
    status: RwLock<RuntimeStatus>,
    inflight: AtomicU32,
    home: OnceCell<String>,
}

impl LocalRuntime {
    /// Construct a runtime rooted at `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            status: RwLock::new(RuntimeStatus::Initializing),
            inflight: AtomicU32::new(0),
            home: OnceCell::new(),
        }
    }

    fn set_status(&self, status: RuntimeStatus) {
        *self.status.write().unwrap() = status;
    }

    /// `$HOME`, looked up once and cached for the runtime's lifetime —
    /// the local-process counterpart to `SshRuntime`'s `echo $HOME`
    /// round trip.
    async fn home_dir(&self) -> &str {
        self.home
            .get_or_init(|| async {
                std::env::var("HOME")
                    .unwrap_or_else(|_| self.working_dir.to_string_lossy().to_string())
            })
            .await
    }

    /// Expand a leading `~` or `~/` to the cached home directory, then
    /// resolve against `working_dir` if still relative.
    async fn resolve(&self, path: &str) -> PathBuf {
        let expanded;
        let path = if path == "~" {
            expanded = self.home_dir().await.to_string();
            expanded.as_str()
        } else if let Some(rest) = path.strip_prefix("~/") {
            expanded = format!("{}/{rest}", self.home_dir().await);
            expanded.as_str()
        } else {
            path
        };
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }

    fn io_error_to_fs(path: &str, e: &std::io::Error) -> FilesystemError {
        match e.kind() {
            std::io::ErrorKind::NotFound => FilesystemError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                FilesystemError::PermissionDenied(path.to_string())
            }
            std::io::ErrorKind::AlreadyExists => FilesystemError::Exists(path.to_string()),
            _ => match e.raw_os_error() {
                Some(28) => FilesystemError::NoSpace(path.to_string()), // ENOSPC
                Some(21) => FilesystemError::IsADirectory(path.to_string()), // EISDIR
                Some(20) => FilesystemError::NotADirectory(path.to_string()), // ENOTDIR
                _ => FilesystemError::NotFound(path.to_string()),
            },
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn initialize(&self) -> Result<(), RecError> {
        let meta = tokio::fs::metadata(&self.working_dir)
            .await
            .map_err(|e| RecError::Configuration(format!("working dir unusable: {e}")))?;
        if !meta.is_dir() {
            return Err(RecError::Configuration(format!(
                "{} is not a directory",
                self.working_dir.display()
            )));
        }
        self.set_status(RuntimeStatus::Ready);
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthCheckResult, RecError> {
        let start = Instant::now();
        let mut req = ExecRequest::new("echo ok");
        req.local_timeout = Duration::from_secs(5);
        let (mut streams, result) = self.exec(req).await?;
        while streams.stdout.recv().await.is_some() {}
        while streams.stderr.recv().await.is_some() {}
        let outcome = result
            .await
            .map_err(|e| RecError::Configuration(e.to_string()))??;
        Ok(HealthCheckResult {
            healthy: outcome.exit_code == 0,
            latency: Some(start.elapsed()),
        })
    }

    async fn exec(
        &self,
        request: ExecRequest,
    ) -> Result<(ExecStreams, tokio::task::JoinHandle<Result<ExecResult, RecError>>), RecError>
    {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.set_status(RuntimeStatus::Busy(self.inflight.load(Ordering::SeqCst)));

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&request.command);
        let cwd = match request.working_dir.as_deref() {
            Some(d) => self.resolve(d).await,
            None => self.working_dir.clone(),
        };
        cmd.current_dir(cwd);
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        for (k, v) in exec::CANONICAL_PREAMBLE {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| RecError::Configuration(format!("failed to spawn local command: {e}")))?;

        let (streams, handle) = exec::drive(child, &request, true).await;
        Ok((streams, handle))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RecError> {
        let full = self.resolve(path).await;
        tokio::fs::read(&full)
            .await
            .map_err(|e| Self::io_error_to_fs(path, &e).into())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), RecError> {
        let real = self.resolve(path).await;
        let mode = match tokio::fs::symlink_metadata(&real).await {
            Ok(meta) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() & 0o7777
                }
                #[cfg(not(unix))]
                {
                    0o644
                }
            }
            Err(_) => 0o644,
        };

        let parent = real.parent().ok_or_else(|| {
            RecError::Filesystem(FilesystemError::NotADirectory(path.to_string()))
        })?;
        let file_name = real
            .file_name()
            .ok_or_else(|| RecError::Filesystem(FilesystemError::IsADirectory(path.to_string())))?
            .to_string_lossy()
            .to_string();
        let tmp = parent.join(format!("{file_name}.tmp.{}", uuid::Uuid::new_v4()));

        let write_result = tokio::fs::write(&tmp, content).await;
        if let Err(e) = write_result {
            return Err(Self::io_error_to_fs(path, &e).into());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await
            {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(Self::io_error_to_fs(path, &e).into());
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp, &real).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_error_to_fs(path, &e).into());
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileStat, RecError> {
        let full = self.resolve(path).await;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Self::io_error_to_fs(path, &e))?;
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        };
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = 0o644;
        Ok(FileStat {
            size: meta.len(),
            mod_time: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            mode,
            kind,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, RecError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(RecError::Filesystem(FilesystemError::NotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), RecError> {
        let full = self.resolve(path).await;
        let result = if recursive {
            tokio::fs::create_dir_all(&full).await
        } else {
            tokio::fs::create_dir(&full).await
        };
        result.map_err(|e| Self::io_error_to_fs(path, &e).into())
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), RecError> {
        let full = self.resolve(path).await;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Self::io_error_to_fs(path, &e))?;
        let result = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&full).await
            } else {
                tokio::fs::remove_dir(&full).await
            }
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| Self::io_error_to_fs(path, &e).into())
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, RecError> {
        let full = self.resolve(path).await;
        let mut read_dir = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| Self::io_error_to_fs(path, &e))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Self::io_error_to_fs(path, &e))?
        {
            let file_type = entry.file_type().await.ok();
            let kind = match file_type {
                Some(t) if t.is_dir() => FileKind::Directory,
                Some(t) if t.is_symlink() => FileKind::Symlink,
                Some(t) if t.is_file() => FileKind::Regular,
                _ => FileKind::Other,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
            });
        }
        Ok(entries)
    }

    async fn open_terminal(&self, options: TerminalOptions) -> Result<Terminal, RecError> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut opts = options;
        opts.cwd = Some(match opts.cwd.take() {
            Some(cwd) => self.resolve(&cwd).await.to_string_lossy().to_string(),
            None => self.working_dir.to_string_lossy().to_string(),
        });
        terminal::spawn_terminal(&shell, &[], opts, None)
            .map_err(|e| RecError::Configuration(e.to_string()))
    }

    fn status(&self) -> RuntimeStatus {
        self.status.read().unwrap().clone()
    }

    async fn dispose(&self) {
        debug!("disposing local runtime");
        self.set_status(RuntimeStatus::Disposed);
    }
}
