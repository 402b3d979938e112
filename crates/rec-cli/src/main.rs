//! Thin smoke-test client for the Remote Execution Core.
//!
//! Not a product surface — a way to exercise a [`rec_core::Runtime`]
//! (local or SSH) from a shell, the same role a small runnable binary
//! plays next to a workspace's library crates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rec_core::{ExecRequest, LocalRuntime, Runtime, SshRuntime};
use rec_ssh::{HostConfig, PoolConfig};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "rec", about = "Remote Execution Core smoke-test client")]
struct Cli {
    /// Run against `[user@]host[:port]` over SSH instead of the local machine
    #[arg(long, global = true)]
    host: Option<String>,

    /// Identity file to use when `--host` is set
    #[arg(long, global = true)]
    identity_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run `echo ok` and report round-trip latency
    Health,
    /// Run a shell command and stream its output
    Exec {
        command: String,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Print a file's contents to stdout
    Read { path: String },
    /// Atomically write stdin to a file
    Write { path: String },
    /// Stat a path
    Stat { path: String },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(long)]
        recursive: bool,
    },
    /// Remove a file or directory
    Rm {
        path: String,
        #[arg(long)]
        recursive: bool,
    },
    /// List a directory's entries
    Ls { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime: Box<dyn Runtime> = match &cli.host {
        Some(host) => {
            let mut config: HostConfig = host
                .parse()
                .with_context(|| format!("invalid host target: {host}"))?;
            config.identity_file = cli.identity_file.clone();
            Box::new(SshRuntime::new(config, PoolConfig::default()))
        }
        None => Box::new(LocalRuntime::new(
            std::env::current_dir().context("resolving current directory")?,
        )),
    };

    runtime.initialize().await.context("initializing runtime")?;

    match cli.command {
        Command::Health => {
            let result = runtime.health_check().await.context("health check")?;
            println!("healthy={} latency={:?}", result.healthy, result.latency);
        }
        Command::Exec { command, timeout_secs } => {
            let mut request = ExecRequest::new(command);
            request.local_timeout = Duration::from_secs(timeout_secs);
            let (mut streams, handle) = runtime.exec(request).await.context("starting exec")?;

            let (mut stdout_done, mut stderr_done) = (false, false);
            while !stdout_done || !stderr_done {
                tokio::select! {
                    chunk = streams.stdout.recv(), if !stdout_done => {
                        match chunk {
                            Some(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
                            None => stdout_done = true,
                        }
                    }
                    chunk = streams.stderr.recv(), if !stderr_done => {
                        match chunk {
                            Some(bytes) => eprint!("{}", String::from_utf8_lossy(&bytes)),
                            None => stderr_done = true,
                        }
                    }
                }
            }
            let result = handle.await.context("joining exec task")?.context("exec failed")?;
            info!(exit_code = result.exit_code, timed_out = result.timed_out, "exec finished");
            std::process::exit(result.exit_code);
        }
        Command::Read { path } => {
            let bytes = runtime.read_file(&path).await.context("read_file")?;
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }
        Command::Write { path } => {
            use std::io::Read;
            let mut content = Vec::new();
            std::io::stdin().read_to_end(&mut content)?;
            runtime.write_file(&path, &content).await.context("write_file")?;
        }
        Command::Stat { path } => {
            let stat = runtime.stat(&path).await.context("stat")?;
            println!(
                "size={} mode={:o} kind={:?}",
                stat.size, stat.mode, stat.kind
            );
        }
        Command::Mkdir { path, recursive } => {
            runtime.mkdir(&path, recursive).await.context("mkdir")?;
        }
        Command::Rm { path, recursive } => {
            runtime.remove(&path, recursive).await.context("remove")?;
        }
        Command::Ls { path } => {
            for entry in runtime.list(&path).await.context("list")? {
                println!("{}\t{:?}", entry.name, entry.kind);
            }
        }
    }

    runtime.dispose().await;
    Ok(())
}
