//! Interactive PTY channel
//!
//! Both `LocalRuntime` and `SshRuntime` drive a real, locally-allocated
//! PTY via `portable-pty`; the only difference is what gets exec'd
//! inside it — a shell for Local, `ssh -tt ...` (built from
//! [`rec_ssh::Connection::pty_args`]) for SSH. Allocating a local pty
//! for the `ssh` child (rather than a plain pipe) is what lets OpenSSH
//! forward window-change signals to the remote pty.

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default scrollback cap: 1 MiB, or 10,000 lines, whichever binds
/// first.
const SCROLLBACK_BYTES_CAP: usize = 1024 * 1024;
const SCROLLBACK_LINES_CAP: usize = 10_000;

/// Options for opening a terminal
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    /// Terminal width in columns
    pub cols: u16,
    /// Terminal height in rows
    pub rows: u16,
    /// Working directory for the spawned shell
    pub cwd: Option<String>,
    /// Environment overlay for the spawned shell
    pub env: std::collections::HashMap<String, String>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            cwd: None,
            env: std::collections::HashMap::new(),
        }
    }
}

impl From<TerminalOptions> for PtySize {
    fn from(opts: TerminalOptions) -> Self {
        PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A POSIX signal name a caller may send to a terminal's foreground
/// process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// SIGINT
    Int,
    /// SIGTERM
    Term,
    /// SIGHUP
    Hup,
}

impl TerminalSignal {
    /// The POSIX shell `kill` signal name for this variant
    pub fn as_posix_name(self) -> &'static str {
        match self {
            TerminalSignal::Int => "INT",
            TerminalSignal::Term => "TERM",
            TerminalSignal::Hup => "HUP",
        }
    }
}

/// Commands sent to the terminal's driving task
enum TerminalCommand {
    Write(Bytes),
    Resize(PtySize),
    Signal(TerminalSignal),
    Close,
}

/// A client-side, best-effort record of recently observed output,
/// capped at [`SCROLLBACK_BYTES_CAP`] bytes or [`SCROLLBACK_LINES_CAP`]
/// lines, whichever binds first. Not a protocol feature.
#[derive(Default)]
pub struct Scrollback {
    lines: Mutex<VecDeque<Bytes>>,
    total_bytes: Mutex<usize>,
}

impl Scrollback {
    /// A fresh, empty scrollback buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk of observed output
    pub fn push(&self, chunk: Bytes) {
        let mut lines = self.lines.lock().unwrap();
        let mut total = self.total_bytes.lock().unwrap();
        *total += chunk.len();
        lines.push_back(chunk);
        while lines.len() > SCROLLBACK_LINES_CAP || *total > SCROLLBACK_BYTES_CAP {
            if let Some(dropped) = lines.pop_front() {
                *total -= dropped.len();
            } else {
                break;
            }
        }
    }

    /// Snapshot everything currently retained, concatenated in order
    pub fn snapshot(&self) -> Bytes {
        let lines = self.lines.lock().unwrap();
        let mut out = Vec::with_capacity(*self.total_bytes.lock().unwrap());
        for chunk in lines.iter() {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }
}

/// A handle to a live terminal session
///
/// Output is a single combined stream (stdout+stderr merged by the
/// pty). Once the underlying connection dies, `output` yields no
/// further chunks and the session is permanently dead — a dropped-out
/// terminal is never resurrected; the caller must open a new one.
pub struct Terminal {
    cmd_tx: mpsc::Sender<TerminalCommand>,
    /// Combined stdout+stderr output stream
    pub output: mpsc::Receiver<Bytes>,
    /// Resolves to `Ok(())` normally, or `Err` if the connection died
    pub closed: oneshot::Receiver<Result<(), String>>,
    scrollback: Arc<Scrollback>,
    /// Ties an external resource (e.g. an SSH pool lease) to this
    /// terminal's lifetime; dropped when the Terminal is.
    _keepalive: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl Terminal {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<TerminalCommand>,
        output: mpsc::Receiver<Bytes>,
        closed: oneshot::Receiver<Result<(), String>>,
        scrollback: Arc<Scrollback>,
        keepalive: Option<Box<dyn std::any::Any + Send + Sync>>,
    ) -> Self {
        Self {
            cmd_tx,
            output,
            closed,
            scrollback,
            _keepalive: keepalive,
        }
    }

    /// Enqueue input. No ordering guarantee across concurrent writers
    /// (callers must serialize their own writes).
    pub async fn write(&self, bytes: Bytes) -> Result<(), TerminalError> {
        self.cmd_tx
            .send(TerminalCommand::Write(bytes))
            .await
            .map_err(|_| TerminalError::Closed)
    }

    /// Best-effort window-change signal
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.cmd_tx
            .send(TerminalCommand::Resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }))
            .await
            .map_err(|_| TerminalError::Closed)
    }

    /// Send a POSIX signal to the terminal's foreground process group
    pub async fn signal(&self, signal: TerminalSignal) -> Result<(), TerminalError> {
        self.cmd_tx
            .send(TerminalCommand::Signal(signal))
            .await
            .map_err(|_| TerminalError::Closed)
    }

    /// Close stdin; the remote shell exits on EOF
    pub async fn close(&self) -> Result<(), TerminalError> {
        self.cmd_tx
            .send(TerminalCommand::Close)
            .await
            .map_err(|_| TerminalError::Closed)
    }

    /// The last N bytes of observed output (client-side, best-effort)
    pub fn scrollback_snapshot(&self) -> Bytes {
        self.scrollback.snapshot()
    }
}

/// Errors a [`Terminal`] handle can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerminalError {
    /// The driving task has already exited
    #[error("terminal is closed")]
    Closed,

    /// The pty or the program within it failed to start
    #[error("failed to spawn terminal: {0}")]
    Spawn(String),
}

/// Open a terminal by spawning `program args...` inside a freshly
/// allocated pty. Used directly by `LocalRuntime` (program = the
/// user's shell) and by `SshRuntime` (program = `ssh`, args built
/// from [`rec_ssh::Connection::pty_args`]) — both funnel through here
/// since the read/write/resize plumbing is identical either way; only
/// what gets exec'd differs.
pub fn spawn_terminal(
    program: &str,
    args: &[String],
    opts: TerminalOptions,
    keepalive: Option<Box<dyn std::any::Any + Send + Sync>>,
) -> Result<Terminal, TerminalError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(opts.clone().into())
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;

    let mut builder = CommandBuilder::new(program);
    builder.args(args);
    if let Some(cwd) = &opts.cwd {
        builder.cwd(cwd);
    }
    for (k, v) in &opts.env {
        builder.env(k, v);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Spawn(e.to_string()))?;

    let (output_tx, output_rx) = mpsc::channel(256);
    let scrollback = Arc::new(Scrollback::new());
    let scrollback_for_reader = Arc::clone(&scrollback);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    scrollback_for_reader.push(chunk.clone());
                    if output_tx.blocking_send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("terminal reader stopped: {e}");
                    break;
                }
            }
        }
    });

    let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
    let (closed_tx, closed_rx) = oneshot::channel();
    let master = pair.master;

    tokio::task::spawn_blocking(move || {
        // Polled rather than a blocking `recv`: the child can exit on its
        // own (the remote shell seeing EOF, the user typing `exit`) with
        // no command ever arriving, and that exit must still be observed
        // promptly rather than leaving this thread parked on `recv`
        // forever.
        let result: Result<(), String> = loop {
            if let Ok(Some(_)) = child.try_wait() {
                break Ok(());
            }
            match cmd_rx.try_recv() {
                Ok(TerminalCommand::Write(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes) {
                        break Err(format!("write failed: {e}"));
                    }
                }
                Ok(TerminalCommand::Resize(size)) => {
                    if let Err(e) = master.resize(size) {
                        warn!("terminal resize failed: {e}");
                    }
                }
                Ok(TerminalCommand::Signal(sig)) => {
                    debug!(signal = sig.as_posix_name(), "terminal signal requested");
                    if sig != TerminalSignal::Hup {
                        // portable-pty exposes only an unconditional kill, not
                        // named signals; INT/TERM both map to it.
                        let _ = child.kill();
                    }
                }
                Ok(TerminalCommand::Close) => {
                    drop(writer);
                    let _ = child.wait();
                    break Ok(());
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(std::time::Duration::from_millis(15));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = child.kill();
                    break Ok(());
                }
            }
        };
        let _ = closed_tx.send(result);
    });

    Ok(Terminal::new(cmd_tx, output_rx, closed_rx, scrollback, keepalive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrollback_caps_total_bytes() {
        let sb = Scrollback::new();
        for _ in 0..20 {
            sb.push(Bytes::from(vec![b'x'; SCROLLBACK_BYTES_CAP / 10]));
        }
        assert!(sb.snapshot().len() <= SCROLLBACK_BYTES_CAP);
    }

    #[test]
    fn scrollback_caps_line_count() {
        let sb = Scrollback::new();
        for _ in 0..(SCROLLBACK_LINES_CAP + 50) {
            sb.push(Bytes::from_static(b"x\n"));
        }
        let lines = sb.lines.lock().unwrap();
        assert!(lines.len() <= SCROLLBACK_LINES_CAP);
    }

    #[test]
    fn terminal_signal_names_are_posix() {
        assert_eq!(TerminalSignal::Int.as_posix_name(), "INT");
        assert_eq!(TerminalSignal::Term.as_posix_name(), "TERM");
        assert_eq!(TerminalSignal::Hup.as_posix_name(), "HUP");
    }
}
