//! Command execution: remote-command construction, dual timeouts,
//! streaming stdout/stderr, and exit-code-to-health classification
//!
//! The actual subprocess is whatever the caller's [`crate::Runtime`]
//! spawned — a bare local child, or an `ssh` child riding a pooled
//! [`rec_ssh::Connection`]. This module only knows how to quote,
//! wrap, drive, and classify; it never dials anything itself.

use crate::cancel::{CancelScope, REMOTE_KILL_GRACE};
use crate::error::RecError;
use bytes::Bytes;
use rec_ssh::HealthSignal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Environment re-applied last, after the caller's overlay, to defeat
/// overrides that would re-enable interactivity.
pub const CANONICAL_PREAMBLE: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("PAGER", "cat"),
    ("GIT_PAGER", "cat"),
    ("GIT_TERMINAL_PROMPT", "0"),
    ("CI", "true"),
];

/// Synthetic exit code used when `cd` to the requested working
/// directory fails remotely. Deliberately outside {0, 124, 137, 255}
/// so it classifies as `CommandFailure`: a chdir failure is the user's
/// problem, not the transport's.
const CHDIR_FAILED_EXIT_CODE: i32 = 98;

/// How much longer than the remote wrapper's own kill timer the local
/// watchdog waits before concluding the transport itself is stuck.
/// Keeps the remote's own `timeout -s KILL` always the first to fire
/// under normal conditions (see the dual-timeout rationale in spec
/// §4.4): local_watchdog = remote_wrapper_seconds + this buffer.
const LOCAL_WATCHDOG_BUFFER: Duration = Duration::from_secs(1);

/// A request to run one command
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Command text, interpreted by a POSIX shell
    pub command: String,
    /// Working directory to `cd` into before running, if any
    pub working_dir: Option<String>,
    /// Environment overlay; the canonical preamble wins on conflicts
    pub env: HashMap<String, String>,
    /// Caller-visible timeout. The remote kill timer is derived from
    /// this, not equal to it (see [`remote_wrapper_seconds`]).
    pub local_timeout: Duration,
    /// Cancellation scope for this operation
    pub cancel: CancelScope,
    /// Optional bytes written to the child's stdin, then closed
    pub stdin: Option<Bytes>,
}

impl ExecRequest {
    /// A request with the default 120s local timeout and no overlay
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: HashMap::new(),
            local_timeout: Duration::from_secs(120),
            cancel: CancelScope::new(),
            stdin: None,
        }
    }
}

/// The outcome of a completed (non-cancelled) exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code visible to the caller (pass-through, except the
    /// synthetic `124` used for the "local timer fired" row)
    pub exit_code: i32,
    /// Whether this outcome resulted from either timer firing
    pub timed_out: bool,
    /// The signal this outcome reports back to the health model
    pub health_signal: HealthSignal,
}

/// Streaming stdout/stderr chunks, delivered before the final result.
/// Chunk boundaries are not semantic (no line-buffering guarantee).
pub struct ExecStreams {
    /// stdout chunks, finite, not restartable
    pub stdout: mpsc::Receiver<Bytes>,
    /// stderr chunks, finite, not restartable
    pub stderr: mpsc::Receiver<Bytes>,
}

/// POSIX single-quote a string for safe embedding in a remote shell
/// command: wrap in `'...'`, escaping embedded quotes as `'\''`.
pub fn posix_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// `ceil(local_timeout / 1s) + 1`: the remote kill timer always gets
/// at least one extra second over the caller's nominal timeout.
pub fn remote_wrapper_seconds(local_timeout: Duration) -> u64 {
    local_timeout.as_secs_f64().ceil() as u64 + 1
}

/// Build the fully-wrapped remote command string: environment preamble
/// (overlay, then the five canonical vars re-applied last), an
/// optional `cd`, the user's command, and the `timeout -s KILL` guard.
pub fn build_remote_command(req: &ExecRequest) -> String {
    let mut script = String::new();

    for (k, v) in &req.env {
        script.push_str(&format!("export {k}={};", posix_quote(v)));
    }
    for (k, v) in CANONICAL_PREAMBLE {
        script.push_str(&format!("export {k}={};", posix_quote(v)));
    }
    if let Some(dir) = &req.working_dir {
        script.push_str(&format!(
            "cd {} || exit {CHDIR_FAILED_EXIT_CODE};",
            posix_quote(dir)
        ));
    }
    script.push_str(&req.command);

    let remote_seconds = remote_wrapper_seconds(req.local_timeout);
    format!(
        "timeout -s KILL {remote_seconds}s /bin/sh -c {}",
        posix_quote(&script)
    )
}

/// Classify a remote exit into `(exit_code, health_signal, timed_out)`.
/// `code = None` means the child was killed by a signal with no
/// reportable code; treated the same as 137.
fn classify_remote_exit(code: Option<i32>) -> (i32, HealthSignal, bool) {
    match code.unwrap_or(137) {
        0 => (0, HealthSignal::Success, false),
        124 => (124, HealthSignal::Timeout, true),
        137 => (137, HealthSignal::Timeout, true),
        255 => (255, HealthSignal::Transport, false),
        other => (other, HealthSignal::CommandFailure, false),
    }
}

/// Same idea for `LocalRuntime`: there is no SSH layer, so 124/137/255
/// carry no special meaning — only 0 vs. non-zero matters, and the
/// signal is never `Transport`.
fn classify_local_exit(code: Option<i32>) -> (i32, HealthSignal, bool) {
    match code {
        Some(0) => (0, HealthSignal::Success, false),
        Some(other) => (other, HealthSignal::CommandFailure, false),
        None => (137, HealthSignal::CommandFailure, false),
    }
}

/// Drive a spawned child to completion: stream its stdout/stderr,
/// enforce the dual-timeout watchdog, and honor cancellation.
///
/// `is_local` selects which exit-code table applies.
/// `local_timeout` is the caller's nominal timeout; the actual local
/// watchdog is set to `remote_wrapper_seconds(local_timeout) +
/// LOCAL_WATCHDOG_BUFFER` so the remote's own kill timer always gets
/// the first chance to fire: if the transport is healthy, the remote
/// wrapper kills the command and the local watchdog never needs to.
pub async fn drive(
    mut child: Child,
    req: &ExecRequest,
    is_local: bool,
) -> (ExecStreams, tokio::task::JoinHandle<Result<ExecResult, RecError>>) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdin = child.stdin.take();

    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    let (stderr_tx, stderr_rx) = mpsc::channel(64);

    if let Some(mut out) = stdout {
        tokio::spawn(async move {
            pump(&mut out, stdout_tx).await;
        });
    }
    if let Some(mut err) = stderr {
        tokio::spawn(async move {
            pump(&mut err, stderr_tx).await;
        });
    }

    let stdin_bytes = req.stdin.clone();
    if let Some(mut sin) = stdin.take() {
        tokio::spawn(async move {
            if let Some(bytes) = stdin_bytes {
                use tokio::io::AsyncWriteExt;
                let _ = sin.write_all(&bytes).await;
            }
            // Dropping `sin` here closes stdin (EOF).
        });
    }

    let local_watchdog =
        Duration::from_secs(remote_wrapper_seconds(req.local_timeout)) + LOCAL_WATCHDOG_BUFFER;
    let cancel = req.cancel.clone();

    let result_task = tokio::spawn(async move {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("exec cancelled, sending SIGTERM and entering kill grace period");
                send_sigterm(&child);
                tokio::select! {
                    status = child.wait() => {
                        let _ = status;
                    }
                    _ = tokio::time::sleep(REMOTE_KILL_GRACE) => {
                        if let Err(e) = child.start_kill() {
                            warn!("failed to kill cancelled child: {e}");
                        }
                        let _ = child.wait().await;
                    }
                }
                Err(RecError::Cancelled)
            }

            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                let (exit_code, health_signal, timed_out) = if is_local {
                    classify_local_exit(code)
                } else {
                    classify_remote_exit(code)
                };
                Ok(ExecResult { exit_code, timed_out, health_signal })
            }

            _ = tokio::time::sleep(local_watchdog) => {
                warn!("local watchdog fired before remote wrapper; treating as transport stall");
                if let Err(e) = child.start_kill() {
                    warn!("failed to kill watchdog-timed-out child: {e}");
                }
                let _ = child.wait().await;
                let health_signal = if is_local { HealthSignal::CommandFailure } else { HealthSignal::Transport };
                Ok(ExecResult { exit_code: 124, timed_out: true, health_signal })
            }
        }
    });

    (
        ExecStreams {
            stdout: stdout_rx,
            stderr: stderr_rx,
        },
        result_task,
    )
}

/// Send SIGTERM to the child's pid, if it still has one. Best-effort:
/// the child may have already exited, in which case `kill` fails
/// harmlessly with ESRCH. `start_kill` (tokio's only built-in) is
/// always SIGKILL, so reaching the actual signal requires going
/// through `libc` directly.
#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a plain integer; `kill` cannot fault.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            debug!("SIGTERM delivery to pid {pid} failed (likely already exited): {err}");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

async fn pump(reader: &mut (impl tokio::io::AsyncRead + Unpin), tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("stream pump stopped: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_quote_wraps_plain_string() {
        assert_eq!(posix_quote("hello"), "'hello'");
    }

    #[test]
    fn posix_quote_escapes_embedded_quote() {
        assert_eq!(posix_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn remote_seconds_adds_one_and_rounds_up() {
        assert_eq!(remote_wrapper_seconds(Duration::from_millis(2500)), 4);
        assert_eq!(remote_wrapper_seconds(Duration::from_secs(2)), 3);
    }

    #[test]
    fn build_remote_command_includes_preamble_and_cd() {
        let mut req = ExecRequest::new("echo hi");
        req.working_dir = Some("/tmp/work".to_string());
        let cmd = build_remote_command(&req);
        assert!(cmd.contains("TERM=dumb"));
        assert!(cmd.contains("cd '/tmp/work'"));
        assert!(cmd.contains("echo hi"));
        assert!(cmd.starts_with("timeout -s KILL"));
    }

    #[test]
    fn canonical_vars_are_applied_after_user_overlay() {
        let mut req = ExecRequest::new("true");
        req.env.insert("TERM".to_string(), "xterm".to_string());
        let cmd = build_remote_command(&req);
        let user_pos = cmd.find("TERM=xterm").unwrap();
        let canonical_pos = cmd.find("TERM=dumb").unwrap();
        assert!(canonical_pos > user_pos, "canonical TERM must win");
    }

    #[test]
    fn classify_remote_success() {
        assert_eq!(
            classify_remote_exit(Some(0)),
            (0, HealthSignal::Success, false)
        );
    }

    #[test]
    fn classify_remote_command_timeout_124() {
        assert_eq!(
            classify_remote_exit(Some(124)),
            (124, HealthSignal::Timeout, true)
        );
    }

    #[test]
    fn classify_remote_kill_timeout_137() {
        assert_eq!(
            classify_remote_exit(Some(137)),
            (137, HealthSignal::Timeout, true)
        );
    }

    #[test]
    fn classify_remote_transport_marker_255() {
        assert_eq!(
            classify_remote_exit(Some(255)),
            (255, HealthSignal::Transport, false)
        );
    }

    #[test]
    fn classify_remote_other_nonzero_is_command_failure() {
        assert_eq!(
            classify_remote_exit(Some(1)),
            (1, HealthSignal::CommandFailure, false)
        );
    }

    #[test]
    fn classify_local_never_reports_transport() {
        for code in [Some(0), Some(1), Some(124), Some(137), Some(255), None] {
            let (_, signal, _) = classify_local_exit(code);
            assert_ne!(signal, HealthSignal::Transport);
        }
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn posix_quote_is_always_safe_shell_atom(s in ".*") {
            let quoted = posix_quote(&s);
            // A single-quoted POSIX atom starts and ends with a quote
            // and never contains a bare (unescaped) one in between.
            prop_assert!(quoted.starts_with('\''));
            prop_assert!(quoted.ends_with('\''));
            let inner = &quoted[1..quoted.len() - 1];
            let mut chars = inner.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    // Every embedded quote must be the `'\''` escape,
                    // i.e. followed by `\''`.
                    prop_assert_eq!(chars.next(), Some('\\'));
                    prop_assert_eq!(chars.next(), Some('\''));
                    prop_assert_eq!(chars.next(), Some('\''));
                }
            }
        }

        #[test]
        fn remote_wrapper_seconds_always_exceeds_local_timeout(millis in 0u64..600_000) {
            let local = Duration::from_millis(millis);
            let remote = remote_wrapper_seconds(local);
            prop_assert!(remote as f64 > local.as_secs_f64());
        }

        #[test]
        fn classify_remote_exit_never_panics_and_matches_table(code in any::<i32>()) {
            let (exit_code, signal, timed_out) = classify_remote_exit(Some(code));
            prop_assert_eq!(exit_code, code);
            match code {
                0 => prop_assert_eq!(signal, HealthSignal::Success),
                124 | 137 => {
                    prop_assert_eq!(signal, HealthSignal::Timeout);
                    prop_assert!(timed_out);
                }
                255 => prop_assert_eq!(signal, HealthSignal::Transport),
                _ => prop_assert_eq!(signal, HealthSignal::CommandFailure),
            }
        }
    }
}
