//! ctrd - container lifecycle supervisor daemon.

use anyhow::Result;
use clap::Parser;
use ctrd::shim::RuntimeShim;
use ctrd::{Config, initialize_services};
use nix::sys::prctl;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctrd")]
#[command(version)]
#[command(about = "Container lifecycle supervisor")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base directory for container state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Path to the OCI runtime binary
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Root directory for the runtime's own state
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Global runtime argument (repeatable)
    #[arg(long = "runtime-arg")]
    runtime_args: Vec<String>,

    /// Timeout for opening process FIFOs, in milliseconds
    #[arg(long)]
    stdio_timeout_ms: Option<u64>,

    /// How long output of an exited container is drained, in milliseconds
    #[arg(long)]
    discard_timeout_ms: Option<u64>,

    /// Delay before resubscribing to runtime events, in milliseconds
    #[arg(long)]
    event_reconnect_delay_ms: Option<u64>,

    /// Capacity of the supervisor task queue
    #[arg(long)]
    task_queue_depth: Option<usize>,

    /// Keep container directories after exit
    #[arg(long)]
    keep_bundles: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(state_dir) = self.state_dir {
            config.state_dir = state_dir;
        }
        if let Some(runtime) = self.runtime {
            config.runtime = runtime;
        }
        if self.runtime_root.is_some() {
            config.runtime_root = self.runtime_root;
        }
        if !self.runtime_args.is_empty() {
            config.runtime_args = self.runtime_args;
        }
        if let Some(ms) = self.stdio_timeout_ms {
            config.stdio_timeout_ms = ms;
        }
        if let Some(ms) = self.discard_timeout_ms {
            config.discard_timeout_ms = ms;
        }
        if let Some(ms) = self.event_reconnect_delay_ms {
            config.event_reconnect_delay_ms = ms;
        }
        if let Some(depth) = self.task_queue_depth {
            config.task_queue_depth = depth;
        }
        config.keep_bundles |= self.keep_bundles;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ctrd=info".parse()?))
        .init();

    let config = Args::parse().into_config()?;
    info!(
        state_dir = %config.state_dir.display(),
        runtime = %config.runtime.display(),
        "ctrd v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Exits of container processes are reaped by us, not by init.
    prctl::set_child_subreaper(true)
        .map_err(|e| anyhow::anyhow!("Failed to set as child subreaper: {}", e))?;

    let shim = Arc::new(RuntimeShim::new(
        config.runtime_root.clone(),
        config.stdio_timeout(),
    ));
    let services = initialize_services(&config, shim).await?;
    info!("ctrd ready");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    services.shutdown().await;
    Ok(())
}
