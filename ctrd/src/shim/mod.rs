//! Shim interface - the out-of-process runtime that creates containers.
//!
//! The supervisor only sees the request/response calls and the event stream
//! defined here. `runtime::RuntimeShim` implements them on top of an OCI
//! runtime binary.

pub mod runtime;

pub use runtime::RuntimeShim;

use crate::error::Result;
use crate::spec::ProcessSpec;
use crate::stdio::StdioPaths;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_stream::Stream;

/// Kind of a shim lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Start,
    Pause,
    Resume,
    Exit,
    ExitProcess,
    Oom,
}

/// Lifecycle event emitted by the shim. Applied exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(rename = "id")]
    pub container_id: String,
    #[serde(rename = "pid", default)]
    pub process_id: String,
    #[serde(rename = "status", default)]
    pub exit_status: u32,
}

impl Event {
    pub fn new(kind: EventType, container_id: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            kind,
            container_id: container_id.into(),
            process_id: process_id.into(),
            exit_status: 0,
        }
    }

    pub fn exit(container_id: impl Into<String>, process_id: impl Into<String>, status: u32) -> Self {
        Self {
            exit_status: status,
            ..Self::new(EventType::Exit, container_id, process_id)
        }
    }
}

/// Stream of events from one subscription. Ends when the subscription breaks.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Runtime binary and the global arguments passed before every subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Everything the shim needs to create and start a container.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub id: String,
    /// Directory holding the persisted `config.json`.
    pub bundle: PathBuf,
    pub stdio: StdioPaths,
    pub terminal: bool,
    /// Checkpoint image to restore from instead of a fresh start.
    pub checkpoint: Option<PathBuf>,
    pub no_pivot_root: bool,
    pub runtime: Runtime,
}

/// Everything the shim needs to exec an extra process into a container.
#[derive(Debug, Clone)]
pub struct AddProcessRequest {
    pub id: String,
    pub process_id: String,
    pub bundle: PathBuf,
    pub spec: ProcessSpec,
    pub stdio: StdioPaths,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub read_at: DateTime<Utc>,
    pub cpu_usage_ns: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: u64,
    /// Full payload as reported by the runtime.
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShimStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

/// The shim's view of a container, used to reconcile after reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShimState {
    pub status: ShimStatus,
    pub pid: u32,
}

/// Request/response contract with the shim plus its event subscription.
#[async_trait]
pub trait Shim: Send + Sync {
    /// Create and start a container, returning the init process's host pid.
    async fn create_container(&self, request: CreateRequest) -> Result<u32>;

    /// Exec a process into a running container, returning its host pid.
    async fn add_process(&self, request: AddProcessRequest) -> Result<u32>;

    async fn signal(&self, id: &str, process_id: &str, signal: i32) -> Result<()>;

    /// The engine closed stdin of a process.
    async fn close_stdin(&self, id: &str, process_id: &str) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    async fn stats(&self, id: &str) -> Result<Stats>;

    /// Current state of a container, `None` if the shim does not know it.
    async fn state(&self, id: &str) -> Result<Option<ShimState>>;

    async fn subscribe_events(&self) -> Result<EventStream>;
}
