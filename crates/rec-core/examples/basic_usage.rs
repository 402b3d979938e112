//! Basic usage example: exec and file operations through the
//! `Runtime` trait, using `LocalRuntime` so the example runs without
//! a reachable SSH host. Swap in `SshRuntime::new(host_config, ..)` to
//! run the same calls remotely — the `Runtime` surface is identical.

use rec_core::{ExecRequest, LocalRuntime, Runtime};
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = LocalRuntime::new(std::env::temp_dir());
    runtime.initialize().await?;

    let health = runtime.health_check().await?;
    println!("health check: healthy={} latency={:?}", health.healthy, health.latency);

    let (mut streams, handle) = runtime.exec(ExecRequest::new("uname -a")).await?;
    while let Some(chunk) = streams.stdout.recv().await {
        print!("{}", String::from_utf8_lossy(&chunk));
    }
    let result = handle.await??;
    println!("exit_code={} timed_out={}", result.exit_code, result.timed_out);

    let path = "rec-core-example.txt";
    runtime.write_file(path, b"hello from rec-core").await?;
    let content = runtime.read_file(path).await?;
    println!("read back: {}", String::from_utf8_lossy(&content));

    let stat = runtime.stat(path).await?;
    println!("size={} mode={:o}", stat.size, stat.mode);

    runtime.remove(path, false).await?;
    runtime.dispose().await;

    Ok(())
}
