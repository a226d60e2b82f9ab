//! Daemon configuration.

use crate::shim::Runtime;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the ctrd services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for container state (specs, FIFOs, pid files).
    pub state_dir: PathBuf,
    /// Path to the OCI runtime binary.
    pub runtime: PathBuf,
    /// Root directory for the runtime's own state (default: the runtime's choice).
    pub runtime_root: Option<PathBuf>,
    /// Global arguments passed to the runtime before every subcommand.
    pub runtime_args: Vec<String>,
    /// How long the shim waits for a FIFO peer.
    pub stdio_timeout_ms: u64,
    /// How long output of an exited container is drained.
    pub discard_timeout_ms: u64,
    /// Delay before resubscribing to shim events.
    pub event_reconnect_delay_ms: u64,
    /// Capacity of the supervisor task queue.
    pub task_queue_depth: usize,
    /// Keep container directories after exit.
    pub keep_bundles: bool,
}

impl Default for Config {
    fn default() -> Self {
        let common = Self {
            state_dir: PathBuf::new(),
            runtime: PathBuf::from("youki"),
            runtime_root: None,
            runtime_args: Vec::new(),
            stdio_timeout_ms: 10_000,
            discard_timeout_ms: 2_000,
            event_reconnect_delay_ms: 1_000,
            task_queue_depth: 32,
            keep_bundles: false,
        };

        if nix::unistd::geteuid().is_root() {
            Self {
                state_dir: PathBuf::from("/run/ctrd"),
                runtime: PathBuf::from("/usr/bin/youki"),
                ..common
            }
        } else {
            // Unprivileged development run
            Self {
                state_dir: PathBuf::from("/tmp/ctrd"),
                ..common
            }
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn default_runtime(&self) -> Runtime {
        Runtime {
            binary: self.runtime.clone(),
            args: self.runtime_args.clone(),
        }
    }

    pub fn stdio_timeout(&self) -> Duration {
        Duration::from_millis(self.stdio_timeout_ms)
    }

    pub fn discard_timeout(&self) -> Duration {
        Duration::from_millis(self.discard_timeout_ms)
    }

    pub fn event_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.event_reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctrd.json");
        std::fs::write(
            &path,
            r#"{"state_dir": "/var/run/ctrd", "runtime_args": ["--debug"], "keep_bundles": true}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/run/ctrd"));
        assert!(config.keep_bundles);
        assert_eq!(config.task_queue_depth, 32);
        assert_eq!(config.stdio_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_runtime().args, vec!["--debug"]);
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctrd.json");
        std::fs::write(&path, "state_dir = 1").unwrap();
        assert!(Config::load(&path).is_err());
        assert!(Config::load(&dir.path().join("missing.json")).is_err());
    }
}
