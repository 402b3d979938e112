//! End-to-end scenarios against `LocalRuntime`: everything that doesn't
//! require a reachable SSH host. The corresponding remote-transport
//! behavior (singleflight, backoff, the 255 transport marker) is
//! covered as unit tests in `rec-ssh` against the pool/health/transport
//! modules directly, since they don't need a live network either.

use rec_core::{ExecRequest, LocalRuntime, Runtime};
use std::time::Duration;

async fn drain(streams: &mut rec_core::ExecStreams) -> (Vec<u8>, Vec<u8>) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;
    while !stdout_done || !stderr_done {
        tokio::select! {
            chunk = streams.stdout.recv(), if !stdout_done => {
                match chunk {
                    Some(bytes) => out.extend_from_slice(&bytes),
                    None => stdout_done = true,
                }
            }
            chunk = streams.stderr.recv(), if !stderr_done => {
                match chunk {
                    Some(bytes) => err.extend_from_slice(&bytes),
                    None => stderr_done = true,
                }
            }
        }
    }
    (out, err)
}

#[tokio::test]
async fn echo_succeeds() {
    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await.unwrap();

    let mut req = ExecRequest::new("echo hello");
    req.local_timeout = Duration::from_secs(10);
    let (mut streams, handle) = runtime.exec(req).await.unwrap();
    let (stdout, _stderr) = drain(&mut streams).await;
    let result = handle.await.unwrap().unwrap();

    assert_eq!(String::from_utf8_lossy(&stdout), "hello\n");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.health_signal, rec_ssh::HealthSignal::Success);
    runtime.dispose().await;
}

#[tokio::test]
async fn command_failure_is_not_an_error() {
    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await.unwrap();

    let (mut streams, handle) = runtime.exec(ExecRequest::new("false")).await.unwrap();
    let _ = drain(&mut streams).await;
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.exit_code, 1);
    assert_eq!(result.health_signal, rec_ssh::HealthSignal::CommandFailure);
    runtime.dispose().await;
}

#[tokio::test]
async fn atomic_write_preserves_permissions_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = LocalRuntime::new(dir.path());
    runtime.initialize().await.unwrap();

    let path = "preserved.txt";
    runtime.write_file(path, b"v1").await.unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path().join(path), std::fs::Permissions::from_mode(0o640))
            .unwrap();
    }

    runtime.write_file(path, b"v2").await.unwrap();

    let content = runtime.read_file(path).await.unwrap();
    assert_eq!(content, b"v2");

    #[cfg(unix)]
    {
        let stat = runtime.stat(path).await.unwrap();
        assert_eq!(stat.mode, 0o640);
    }

    let siblings: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(
        !siblings.iter().any(|n| n.contains(".tmp.")),
        "no leftover temp file should remain: {siblings:?}"
    );

    runtime.dispose().await;
}

#[tokio::test]
async fn zero_length_write_produces_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = LocalRuntime::new(dir.path());
    runtime.initialize().await.unwrap();

    runtime.write_file("empty.txt", b"").await.unwrap();
    let stat = runtime.stat("empty.txt").await.unwrap();
    assert_eq!(stat.size, 0);
    runtime.dispose().await;
}

#[tokio::test]
async fn mkdir_recursive_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = LocalRuntime::new(dir.path());
    runtime.initialize().await.unwrap();

    runtime.mkdir("a/b/c", true).await.unwrap();
    runtime.mkdir("a/b/c", true).await.unwrap();
    assert!(runtime.exists("a/b/c").await.unwrap());
    runtime.dispose().await;
}

#[tokio::test]
async fn list_on_empty_directory_is_empty_not_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = LocalRuntime::new(dir.path());
    runtime.initialize().await.unwrap();

    runtime.mkdir("empty-dir", false).await.unwrap();
    let entries = runtime.list("empty-dir").await.unwrap();
    assert!(entries.is_empty());
    runtime.dispose().await;
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await.unwrap();
    runtime.dispose().await;
    runtime.dispose().await;
    assert_eq!(runtime.status(), rec_core::RuntimeStatus::Disposed);
}

#[tokio::test]
async fn dual_timeout_fires_and_runtime_survives() {
    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await.unwrap();

    let mut req = ExecRequest::new("sleep 30");
    req.local_timeout = Duration::from_secs(2);
    let start = std::time::Instant::now();
    let (mut streams, handle) = runtime.exec(req).await.unwrap();
    let _ = drain(&mut streams).await;
    let result = handle.await.unwrap().unwrap();

    assert!(result.timed_out);
    assert!(start.elapsed() < Duration::from_secs(6));

    // The runtime itself is not torn down by a timed-out command.
    let (mut streams, handle) = runtime.exec(ExecRequest::new("echo ok")).await.unwrap();
    let (stdout, _) = drain(&mut streams).await;
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), "ok");

    runtime.dispose().await;
}

#[tokio::test]
async fn cancelling_exec_reports_cancelled_within_grace_period() {
    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await.unwrap();

    let mut req = ExecRequest::new("sleep 30");
    req.local_timeout = Duration::from_secs(60);
    let cancel = req.cancel.clone();

    let (mut streams, handle) = runtime.exec(req).await.unwrap();
    let cancel_at = std::time::Instant::now();
    cancel.cancel();

    let _ = drain(&mut streams).await;
    let result = handle.await.unwrap();

    assert!(matches!(result, Err(rec_core::RecError::Cancelled)));
    assert!(
        cancel_at.elapsed() < rec_core::REMOTE_KILL_GRACE + Duration::from_secs(1),
        "cancellation should resolve within the kill grace period"
    );

    runtime.dispose().await;
}
