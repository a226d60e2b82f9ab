//! Supervisor - the single task-processing loop in front of the runtime client.
//!
//! Callers submit [`Task`]s through a [`SupervisorHandle`]. The loop answers
//! cheap tasks inline and hands everything that talks to the shim to a
//! background worker, so one slow container never stalls the others.

mod dispatcher;

pub use dispatcher::Supervisor;

use crate::client::StateChange;
use crate::container::ContainerState;
use crate::error::{Error, Result};
use crate::shim::{Runtime, Stats};
use crate::spec::ProcessSpec;
use crate::stdio::{StdioCallback, StdioPaths};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

/// One-shot result channel of a task. Sending consumes it.
pub struct Reply<T>(oneshot::Sender<Result<T>>);

impl<T> Reply<T> {
    pub fn new() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn send(self, result: Result<T>) {
        if self.0.send(result).is_err() {
            debug!("Task caller went away before the reply");
        }
    }
}

/// Outcome of a handler: answered inline or left to a worker.
pub enum Handled<T> {
    Ready(Result<T>),
    Deferred(Pin<Box<dyn Future<Output = Result<T>> + Send>>),
}

impl<T> Handled<T> {
    pub fn deferred(fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Handled::Deferred(Box::pin(fut))
    }
}

/// Start a container from a bundle directory.
pub struct StartRequest {
    pub id: String,
    /// Bundle holding `config.json` and usually the rootfs.
    pub bundle: PathBuf,
    pub stdio: StdioPaths,
    pub labels: Vec<String>,
    pub no_pivot_root: bool,
    /// Name of a checkpoint to restore from.
    pub checkpoint: Option<String>,
    /// Directory holding checkpoints, `<bundle>/checkpoints` when unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// Runtime binary overriding the configured default.
    pub runtime: Option<PathBuf>,
    /// Global args for `runtime`, only used together with it.
    pub runtime_args: Vec<String>,
    pub attach: StdioCallback,
}

impl StartRequest {
    /// Request with defaults and discarded stdio.
    pub fn new(id: impl Into<String>, bundle: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            bundle: bundle.into(),
            stdio: StdioPaths::default(),
            labels: Vec::new(),
            no_pivot_root: false,
            checkpoint: None,
            checkpoint_dir: None,
            runtime: None,
            runtime_args: Vec::new(),
            attach: crate::stdio::discard_stdio(),
        }
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        let name = self.checkpoint.as_ref()?;
        let dir = self
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.bundle.join("checkpoints"));
        Some(dir.join(name))
    }

    /// Runtime to use: the override with its own args if set, else `default`.
    fn select_runtime(&self, default: &Runtime) -> Runtime {
        match &self.runtime {
            Some(binary) => Runtime {
                binary: binary.clone(),
                args: self.runtime_args.clone(),
            },
            None => default.clone(),
        }
    }
}

/// Exec an extra process into a running container.
pub struct AddProcessRequest {
    pub id: String,
    pub process_id: String,
    pub spec: ProcessSpec,
    pub stdio: StdioPaths,
    pub attach: StdioCallback,
}

impl AddProcessRequest {
    pub fn new(id: impl Into<String>, process_id: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            id: id.into(),
            process_id: process_id.into(),
            spec,
            stdio: StdioPaths::default(),
            attach: crate::stdio::discard_stdio(),
        }
    }
}

/// Unit of work for the supervisor loop.
pub enum Task {
    Start {
        request: StartRequest,
        reply: Reply<u32>,
    },
    Signal {
        id: String,
        signal: i32,
        reply: Reply<()>,
    },
    SignalProcess {
        id: String,
        process_id: String,
        signal: i32,
        reply: Reply<()>,
    },
    AddProcess {
        request: AddProcessRequest,
        reply: Reply<u32>,
    },
    Stats {
        id: String,
        reply: Reply<Stats>,
    },
    Pause {
        id: String,
        reply: Reply<()>,
    },
    Resume {
        id: String,
        reply: Reply<()>,
    },
    Delete {
        id: String,
        reply: Reply<()>,
    },
    List {
        reply: Reply<Vec<ContainerRecord>>,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Start { .. } => "start",
            Task::Signal { .. } => "signal",
            Task::SignalProcess { .. } => "signal-process",
            Task::AddProcess { .. } => "add-process",
            Task::Stats { .. } => "stats",
            Task::Pause { .. } => "pause",
            Task::Resume { .. } => "resume",
            Task::Delete { .. } => "delete",
            Task::List { .. } => "list",
        }
    }
}

/// Supervisor's view of a container, kept after exit until deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub bundle: PathBuf,
    pub labels: Vec<String>,
    pub runtime: Runtime,
    pub status: ContainerState,
    pub pid: u32,
    pub exit_status: Option<u32>,
    pub oom_killed: bool,
    /// Exec'd processes: process id -> host pid.
    pub processes: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

/// Cloneable front end for submitting tasks.
#[derive(Clone)]
pub struct SupervisorHandle {
    tasks: mpsc::Sender<Task>,
    changes: broadcast::Sender<StateChange>,
}

impl SupervisorHandle {
    pub(crate) fn new(tasks: mpsc::Sender<Task>, changes: broadcast::Sender<StateChange>) -> Self {
        Self { tasks, changes }
    }

    /// Submit a task and wait for its reply.
    pub async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> Task) -> Result<T> {
        let (reply, rx) = Reply::new();
        self.tasks
            .send(make(reply))
            .await
            .map_err(|_| Error::Unavailable)?;
        rx.await.map_err(|_| Error::Unavailable)?
    }

    /// Start a container, returning the init pid.
    pub async fn start(&self, request: StartRequest) -> Result<u32> {
        self.submit(|reply| Task::Start { request, reply }).await
    }

    pub async fn signal(&self, id: &str, signal: i32) -> Result<()> {
        let id = id.to_string();
        self.submit(|reply| Task::Signal { id, signal, reply }).await
    }

    pub async fn signal_process(&self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        let id = id.to_string();
        let process_id = process_id.to_string();
        self.submit(|reply| Task::SignalProcess {
            id,
            process_id,
            signal,
            reply,
        })
        .await
    }

    /// Exec a process, returning its host pid.
    pub async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        self.submit(|reply| Task::AddProcess { request, reply }).await
    }

    pub async fn stats(&self, id: &str) -> Result<Stats> {
        let id = id.to_string();
        self.submit(|reply| Task::Stats { id, reply }).await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.submit(|reply| Task::Pause { id, reply }).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.submit(|reply| Task::Resume { id, reply }).await
    }

    /// Forget an exited container.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.submit(|reply| Task::Delete { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<ContainerRecord>> {
        self.submit(|reply| Task::List { reply }).await
    }

    /// State changes applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_path() {
        let mut request = StartRequest::new("c1", "/bundles/c1");
        assert!(request.checkpoint_path().is_none());

        request.checkpoint = Some("cp1".into());
        assert_eq!(
            request.checkpoint_path(),
            Some(PathBuf::from("/bundles/c1/checkpoints/cp1"))
        );

        request.checkpoint_dir = Some("/var/lib/checkpoints".into());
        assert_eq!(
            request.checkpoint_path(),
            Some(PathBuf::from("/var/lib/checkpoints/cp1"))
        );
    }

    #[test]
    fn test_runtime_selection() {
        let default = Runtime {
            binary: "youki".into(),
            args: vec!["--debug".into()],
        };
        let mut request = StartRequest::new("c1", "/bundles/c1");
        assert_eq!(request.select_runtime(&default), default);

        request.runtime = Some("/usr/bin/runc".into());
        request.runtime_args = vec!["--systemd-cgroup".into()];
        let selected = request.select_runtime(&default);
        assert_eq!(selected.binary, PathBuf::from("/usr/bin/runc"));
        assert_eq!(selected.args, vec!["--systemd-cgroup"]);

        // Args of the default runtime never leak into an override.
        request.runtime_args.clear();
        let selected = request.select_runtime(&default);
        assert_eq!(selected.binary, PathBuf::from("/usr/bin/runc"));
        assert!(selected.args.is_empty());

        // Args without an override binary are ignored.
        request.runtime = None;
        request.runtime_args = vec!["--systemd-cgroup".into()];
        assert_eq!(request.select_runtime(&default), default);
    }

    #[tokio::test]
    async fn test_reply_after_caller_left() {
        let (reply, rx) = Reply::<u32>::new();
        drop(rx);
        reply.send(Ok(1));
    }
}
