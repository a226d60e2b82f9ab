//! Error types for ctrd.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by supervisor tasks and runtime client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation on a container id that is not live.
    #[error("container {0} not found")]
    NotFound(String),

    /// Operation on an unknown process of a live container.
    #[error("process {process} not found in container {container}")]
    ProcessNotFound { container: String, process: String },

    /// Create on a container id that is still live.
    #[error("container {0} is already active")]
    AlreadyActive(String),

    /// AddProcess with a process id already registered.
    #[error("process {process} already exists in container {container}")]
    ProcessExists { container: String, process: String },

    #[error("invalid container state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The shim was unreachable or rejected the request.
    #[error("shim request failed: {0}")]
    Ipc(String),

    #[error("timed out opening fifo {}", .0.display())]
    StdioOpenTimeout(PathBuf),

    #[error("invalid runtime spec: {0}")]
    Spec(String),

    /// The supervisor loop is gone.
    #[error("supervisor unavailable")]
    Unavailable,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

impl Error {
    /// Shorthand used by the shim implementations.
    pub fn ipc(msg: impl Into<String>) -> Self {
        Error::Ipc(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
