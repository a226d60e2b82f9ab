//! Runtime client - owns live container state and talks to the shim.
//!
//! Lifecycle operations run under the container's per-id lock. Shim events
//! are applied one at a time per container through the serial queue (see
//! `events`). Every applied transition is reported as a [`StateChange`].

mod events;

use crate::bundle;
use crate::config::Config;
use crate::container::{self, Container, ContainerState};
use crate::error::{Error, Result};
use crate::notifier::{ExitNotifier, ExitNotifiers};
use crate::process::{INIT_PROCESS, ProcessHandle};
use crate::queue::SerialQueue;
use crate::registry::ContainerRegistry;
use crate::shim::{self, Runtime, Shim, Stats};
use crate::spec::{CONFIG_FILENAME, ProcessSpec, RuntimeSpec};
use crate::stdio::{self, CloseNotify, StdioCallback, StdioPaths};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Notification emitted after a transition was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateChange {
    Started { id: String, pid: u32 },
    CreateFailed { id: String, error: String },
    ProcessStarted { id: String, process: String, pid: u32 },
    Exited { id: String, status: u32, oom_killed: bool },
    ProcessExited { id: String, process: String, status: u32 },
    Paused { id: String },
    Resumed { id: String },
    OutOfMemory { id: String },
}

impl StateChange {
    pub fn id(&self) -> &str {
        match self {
            StateChange::Started { id, .. }
            | StateChange::CreateFailed { id, .. }
            | StateChange::ProcessStarted { id, .. }
            | StateChange::Exited { id, .. }
            | StateChange::ProcessExited { id, .. }
            | StateChange::Paused { id }
            | StateChange::Resumed { id }
            | StateChange::OutOfMemory { id } => id,
        }
    }
}

/// Per-create settings besides the spec itself.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub runtime: Runtime,
    /// Caller-chosen FIFO paths. Unset ones default into the container dir.
    pub stdio: StdioPaths,
    /// Checkpoint image to restore from.
    pub checkpoint: Option<PathBuf>,
    pub no_pivot_root: bool,
}

/// Client-side settings taken from the daemon config.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub state_dir: PathBuf,
    pub discard_timeout: Duration,
    pub event_reconnect_delay: Duration,
    pub keep_bundles: bool,
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            discard_timeout: config.discard_timeout(),
            event_reconnect_delay: config.event_reconnect_delay(),
            keep_bundles: config.keep_bundles,
        }
    }
}

/// Runtime client.
pub struct RuntimeClient {
    shim: Arc<dyn Shim>,
    registry: ContainerRegistry,
    notifiers: ExitNotifiers,
    queue: SerialQueue,
    changes: mpsc::Sender<StateChange>,
    options: ClientOptions,
}

impl RuntimeClient {
    pub fn new(
        shim: Arc<dyn Shim>,
        options: ClientOptions,
        changes: mpsc::Sender<StateChange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shim,
            registry: ContainerRegistry::new(),
            notifiers: ExitNotifiers::new(),
            queue: SerialQueue::new(),
            changes,
            options,
        })
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Lifecycle state of a live container.
    pub fn state(&self, id: &str) -> Result<ContainerState> {
        self.registry.with(id, |c| c.state)
    }

    /// Exit notifier of a container, available from create until exit.
    pub fn exit_notifier(&self, id: &str) -> Option<Arc<ExitNotifier>> {
        self.notifiers.get(id)
    }

    async fn emit(&self, change: StateChange) {
        if self.changes.send(change).await.is_err() {
            debug!("State change receiver closed");
        }
    }

    fn close_stdin_notify(&self, id: &str, process_id: &str) -> CloseNotify {
        let shim = self.shim.clone();
        let id = id.to_string();
        let process_id = process_id.to_string();
        Box::new(move || {
            Box::pin(async move {
                if let Err(e) = shim.close_stdin(&id, &process_id).await {
                    warn!(id = %id, process = %process_id, "Failed to close stdin: {}", e);
                }
            })
        })
    }

    /// Create and start a container, returning the init pid.
    ///
    /// On failure everything done so far is rolled back and the original
    /// error is returned.
    pub async fn create(
        &self,
        id: &str,
        spec: RuntimeSpec,
        attach: StdioCallback,
        options: CreateOptions,
    ) -> Result<u32> {
        let _guard = self.registry.lock(id).await;
        if self.registry.contains(id) {
            return Err(Error::AlreadyActive(id.to_string()));
        }

        let mut dir = None;
        let created: Result<u32> = async {
            let (uid, gid) = spec.root_ids()?;
            let root = bundle::prepare_bundle_root(&self.options.state_dir, uid, gid).await?;
            let container_dir: &Path = dir.insert(root.join(id));
            container::clean_dir(container_dir).await?;

            info!(id = %id, dir = %container_dir.display(), "Creating container");
            self.create_locked(id, container_dir, spec, (uid, gid), attach, options)
                .await
        }
        .await;

        match created {
            Ok(pid) => Ok(pid),
            Err(e) => {
                warn!(id = %id, "Create failed, rolling back: {}", e);
                if let Some(c) = self.registry.remove(id) {
                    stdio::remove_fifos(&c.init_stdio).await;
                }
                if let Some(dir) = &dir
                    && let Err(clean_err) = container::clean_dir(dir).await
                {
                    warn!(id = %id, "Failed to clean container dir: {}", clean_err);
                }
                self.notifiers.close(id);
                self.emit(StateChange::CreateFailed {
                    id: id.to_string(),
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn create_locked(
        &self,
        id: &str,
        dir: &Path,
        spec: RuntimeSpec,
        (uid, gid): (u32, u32),
        attach: StdioCallback,
        options: CreateOptions,
    ) -> Result<u32> {
        bundle::mkdir_all_as(dir, uid, gid).await?;
        tokio::fs::write(dir.join(CONFIG_FILENAME), serde_json::to_vec(&spec)?).await?;

        // Read back what the runtime will see.
        let spec = RuntimeSpec::from_bundle(dir).await?;
        let terminal = spec.terminal();
        let stdio_paths = options.stdio.or_defaults(dir, INIT_PROCESS, terminal);

        // Dropped on failure, which abandons a pending stdin close.
        let (gate_tx, gate_rx) = oneshot::channel();
        let io = stdio::open_fifos(
            &stdio_paths,
            gate_rx,
            self.close_stdin_notify(id, INIT_PROCESS),
        )?;

        self.registry.insert(Container::new(
            id,
            dir.to_path_buf(),
            options.runtime.clone(),
            stdio_paths.clone(),
        ))?;
        self.notifiers.get_or_create(id);

        attach(io)?;

        let pid = self
            .shim
            .create_container(shim::CreateRequest {
                id: id.to_string(),
                bundle: dir.to_path_buf(),
                stdio: stdio_paths,
                terminal,
                checkpoint: options.checkpoint,
                no_pivot_root: options.no_pivot_root,
                runtime: options.runtime,
            })
            .await?;

        self.registry.with(id, |c| {
            c.state = ContainerState::Running;
            c.init_pid = pid;
        })?;
        let _ = gate_tx.send(());

        info!(id = %id, pid, "Container running");
        self.emit(StateChange::Started {
            id: id.to_string(),
            pid,
        })
        .await;
        Ok(pid)
    }

    /// Signal the init process of a container.
    pub async fn signal(&self, id: &str, signal: i32) -> Result<()> {
        self.signal_process(id, INIT_PROCESS, signal).await
    }

    /// Signal one process of a container.
    pub async fn signal_process(&self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        let _guard = self.registry.lock(id).await;
        debug!(id = %id, process = %process_id, signal, "Signalling process");
        self.shim.signal(id, process_id, signal).await
    }

    /// Exec an additional process into a running container.
    pub async fn add_process(
        &self,
        id: &str,
        process_id: &str,
        spec: ProcessSpec,
        stdio_paths: StdioPaths,
        attach: StdioCallback,
    ) -> Result<u32> {
        let _guard = self.registry.lock(id).await;
        let (dir, state, exists) = self.registry.with(id, |c| {
            (
                c.dir.clone(),
                c.state,
                c.processes.contains(process_id),
            )
        })?;
        if state != ContainerState::Running {
            return Err(Error::InvalidState {
                expected: ContainerState::Running.to_string(),
                actual: state.to_string(),
            });
        }
        if exists || process_id == INIT_PROCESS {
            return Err(Error::ProcessExists {
                container: id.to_string(),
                process: process_id.to_string(),
            });
        }

        let stdio_paths = stdio_paths.or_defaults(&dir, process_id, spec.terminal);
        let (gate_tx, gate_rx) = oneshot::channel();
        let launched: Result<u32> = async {
            let io = stdio::open_fifos(
                &stdio_paths,
                gate_rx,
                self.close_stdin_notify(id, process_id),
            )?;
            attach(io)?;
            self.shim
                .add_process(shim::AddProcessRequest {
                    id: id.to_string(),
                    process_id: process_id.to_string(),
                    bundle: dir.clone(),
                    spec,
                    stdio: stdio_paths.clone(),
                })
                .await
        }
        .await;

        let pid = match launched {
            Ok(pid) => pid,
            Err(e) => {
                stdio::remove_fifos(&stdio_paths).await;
                return Err(e);
            }
        };

        self.registry.with(id, |c| {
            c.processes.insert(ProcessHandle {
                id: process_id.to_string(),
                container_id: id.to_string(),
                system_pid: pid,
                stdio: stdio_paths,
            })
        })?;
        let _ = gate_tx.send(());

        info!(id = %id, process = %process_id, pid, "Process started");
        self.emit(StateChange::ProcessStarted {
            id: id.to_string(),
            process: process_id.to_string(),
            pid,
        })
        .await;
        Ok(pid)
    }

    /// Pause a running container and wait until the pause was applied.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.transition(id, ContainerState::Running, ContainerState::Paused)
            .await
    }

    /// Resume a paused container and wait until the resume was applied.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.transition(id, ContainerState::Paused, ContainerState::Running)
            .await
    }

    async fn transition(&self, id: &str, from: ContainerState, to: ContainerState) -> Result<()> {
        let applied = {
            let _guard = self.registry.lock(id).await;
            let state = self.registry.with(id, |c| c.state)?;
            if state == to {
                return Ok(());
            }
            if state != from {
                return Err(Error::InvalidState {
                    expected: from.to_string(),
                    actual: state.to_string(),
                });
            }

            match to {
                ContainerState::Paused => self.shim.pause(id).await?,
                _ => self.shim.resume(id).await?,
            }
            // The event cannot be applied before the lock is released.
            self.registry.with(id, |c| c.wait_for(to))?
        };

        applied
            .await
            .map_err(|_| Error::NotFound(id.to_string()))
    }

    /// Resource usage of a live container.
    pub async fn stats(&self, id: &str) -> Result<Stats> {
        let _guard = self.registry.lock(id).await;
        if !self.registry.contains(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        self.shim.stats(id).await
    }
}
