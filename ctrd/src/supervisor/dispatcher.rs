//! Supervisor loop - routes tasks to handlers and mirrors state changes.

use super::{AddProcessRequest, ContainerRecord, Handled, Reply, StartRequest, SupervisorHandle, Task};
use crate::client::{CreateOptions, RuntimeClient, StateChange};
use crate::container::ContainerState;
use crate::error::{Error, Result};
use crate::shim::{Runtime, Stats};
use crate::spec::RuntimeSpec;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const BROADCAST_CAPACITY: usize = 256;

/// The task-processing loop.
pub struct Supervisor {
    tasks: mpsc::Receiver<Task>,
    changes: mpsc::Receiver<StateChange>,
    /// Used by start workers that fail before the client got involved.
    changes_tx: mpsc::Sender<StateChange>,
    broadcast: broadcast::Sender<StateChange>,
    client: Arc<RuntimeClient>,
    default_runtime: Runtime,
    records: HashMap<String, ContainerRecord>,
}

impl Supervisor {
    /// Create the loop and its handle.
    ///
    /// `changes` must be the receiving end of the channel the client emits
    /// state changes on, `changes_tx` a sender of the same channel.
    pub fn new(
        client: Arc<RuntimeClient>,
        changes: mpsc::Receiver<StateChange>,
        changes_tx: mpsc::Sender<StateChange>,
        default_runtime: Runtime,
        queue_depth: usize,
    ) -> (Self, SupervisorHandle) {
        let (task_tx, tasks) = mpsc::channel(queue_depth);
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let handle = SupervisorHandle::new(task_tx, broadcast.clone());
        let supervisor = Self {
            tasks,
            changes,
            changes_tx,
            broadcast,
            client,
            default_runtime,
            records: HashMap::new(),
        };
        (supervisor, handle)
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        info!("Supervisor: Running and waiting for tasks");

        loop {
            // Pending state changes go first so tasks see the latest records.
            tokio::select! {
                biased;
                Some(change) = self.changes.recv() => {
                    self.apply_change(change);
                }
                task = self.tasks.recv() => {
                    let Some(task) = task else {
                        break;
                    };
                    debug!(kind = task.kind(), "Supervisor: Task received");
                    self.dispatch(task);
                }
            }
        }

        info!("Supervisor: Shutting down");
    }

    fn dispatch(&mut self, task: Task) {
        match task {
            Task::Start { request, reply } => {
                let handled = self.handle_start(request);
                complete(handled, reply);
            }
            Task::Signal { id, signal, reply } => {
                let handled = self.handle_signal(id, None, signal);
                complete(handled, reply);
            }
            Task::SignalProcess {
                id,
                process_id,
                signal,
                reply,
            } => {
                let handled = self.handle_signal(id, Some(process_id), signal);
                complete(handled, reply);
            }
            Task::AddProcess { request, reply } => {
                let handled = self.handle_add_process(request);
                complete(handled, reply);
            }
            Task::Stats { id, reply } => {
                let handled = self.handle_stats(id);
                complete(handled, reply);
            }
            Task::Pause { id, reply } => {
                let handled = self.handle_pause(id, true);
                complete(handled, reply);
            }
            Task::Resume { id, reply } => {
                let handled = self.handle_pause(id, false);
                complete(handled, reply);
            }
            Task::Delete { id, reply } => {
                reply.send(self.handle_delete(&id));
            }
            Task::List { reply } => {
                let mut records: Vec<_> = self.records.values().cloned().collect();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                reply.send(Ok(records));
            }
        }
    }

    /// The record of a container that has not exited.
    fn live_record(&self, id: &str) -> Result<&ContainerRecord> {
        self.records
            .get(id)
            .filter(|r| r.status != ContainerState::Exited)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn handle_start(&mut self, request: StartRequest) -> Handled<u32> {
        if self.live_record(&request.id).is_ok() {
            return Handled::Ready(Err(Error::AlreadyActive(request.id)));
        }

        let runtime = request.select_runtime(&self.default_runtime);
        info!(id = %request.id, bundle = %request.bundle.display(), "Supervisor: Starting container");
        self.records.insert(
            request.id.clone(),
            ContainerRecord {
                id: request.id.clone(),
                bundle: request.bundle.clone(),
                labels: request.labels.clone(),
                runtime: runtime.clone(),
                status: ContainerState::Starting,
                pid: 0,
                exit_status: None,
                oom_killed: false,
                processes: BTreeMap::new(),
                created_at: Utc::now(),
            },
        );

        let client = self.client.clone();
        let changes = self.changes_tx.clone();
        Handled::deferred(async move {
            let options = CreateOptions {
                runtime,
                stdio: request.stdio.clone(),
                checkpoint: request.checkpoint_path(),
                no_pivot_root: request.no_pivot_root,
            };

            let mut spec = match RuntimeSpec::from_bundle(&request.bundle).await {
                Ok(spec) => spec,
                Err(e) => {
                    let _ = changes
                        .send(StateChange::CreateFailed {
                            id: request.id.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    return Err(e);
                }
            };
            spec.absolutize_root(&request.bundle);

            client
                .create(&request.id, spec, request.attach, options)
                .await
        })
    }

    fn handle_signal(&self, id: String, process_id: Option<String>, signal: i32) -> Handled<()> {
        if let Err(e) = self.live_record(&id) {
            return Handled::Ready(Err(e));
        }
        let client = self.client.clone();
        Handled::deferred(async move {
            match process_id {
                Some(process_id) => client.signal_process(&id, &process_id, signal).await,
                None => client.signal(&id, signal).await,
            }
        })
    }

    fn handle_add_process(&self, request: AddProcessRequest) -> Handled<u32> {
        if let Err(e) = self.live_record(&request.id) {
            return Handled::Ready(Err(e));
        }
        let client = self.client.clone();
        Handled::deferred(async move {
            client
                .add_process(
                    &request.id,
                    &request.process_id,
                    request.spec,
                    request.stdio,
                    request.attach,
                )
                .await
        })
    }

    fn handle_stats(&self, id: String) -> Handled<Stats> {
        if let Err(e) = self.live_record(&id) {
            return Handled::Ready(Err(e));
        }
        let client = self.client.clone();
        Handled::deferred(async move { client.stats(&id).await })
    }

    fn handle_pause(&self, id: String, pause: bool) -> Handled<()> {
        if let Err(e) = self.live_record(&id) {
            return Handled::Ready(Err(e));
        }
        let client = self.client.clone();
        Handled::deferred(async move {
            if pause {
                client.pause(&id).await
            } else {
                client.resume(&id).await
            }
        })
    }

    fn handle_delete(&mut self, id: &str) -> Result<()> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if record.status != ContainerState::Exited {
            return Err(Error::InvalidState {
                expected: ContainerState::Exited.to_string(),
                actual: record.status.to_string(),
            });
        }
        self.records.remove(id);
        info!(id = %id, "Supervisor: Container deleted");
        Ok(())
    }

    /// Mirror a client state change into the record table and rebroadcast it.
    fn apply_change(&mut self, change: StateChange) {
        let id = change.id().to_string();
        match &change {
            StateChange::CreateFailed { error, .. } => {
                if self
                    .records
                    .get(&id)
                    .is_some_and(|r| r.status == ContainerState::Starting)
                {
                    self.records.remove(&id);
                }
                warn!(id = %id, "Supervisor: Container create failed: {}", error);
            }
            _ => match self.records.get_mut(&id) {
                Some(record) => update_record(record, &change),
                None => debug!(id = %id, "Supervisor: State change for unknown record"),
            },
        }

        // No receivers is fine.
        let _ = self.broadcast.send(change);
    }
}

fn update_record(record: &mut ContainerRecord, change: &StateChange) {
    match change {
        StateChange::Started { pid, .. } => {
            record.status = ContainerState::Running;
            record.pid = *pid;
        }
        StateChange::ProcessStarted { process, pid, .. } => {
            record.processes.insert(process.clone(), *pid);
        }
        StateChange::ProcessExited { process, .. } => {
            record.processes.remove(process);
        }
        StateChange::Exited {
            status, oom_killed, ..
        } => {
            record.status = ContainerState::Exited;
            record.exit_status = Some(*status);
            record.oom_killed = *oom_killed;
            record.processes.clear();
        }
        StateChange::Paused { .. } => record.status = ContainerState::Paused,
        StateChange::Resumed { .. } => record.status = ContainerState::Running,
        StateChange::OutOfMemory { .. } | StateChange::CreateFailed { .. } => {}
    }
}

/// Fulfil `reply` with the handler's outcome, off-loop when deferred.
fn complete<T: Send + 'static>(handled: Handled<T>, reply: Reply<T>) {
    match handled {
        Handled::Ready(result) => reply.send(result),
        Handled::Deferred(work) => {
            tokio::spawn(async move {
                reply.send(work.await);
            });
        }
    }
}
