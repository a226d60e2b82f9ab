//! Shim event consumption.

use super::{RuntimeClient, StateChange};
use crate::container::{self, ContainerState};
use crate::error::Error;
use crate::process::INIT_PROCESS;
use crate::shim::{Event, EventType, ShimState, ShimStatus};
use crate::stdio;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Exit status reported for a container that vanished while disconnected.
const LOST_EXIT_STATUS: u32 = 255;

impl RuntimeClient {
    /// Queue `event` behind all earlier events of the same container.
    pub fn handle_event(self: &Arc<Self>, event: Event) {
        let client = Arc::clone(self);
        self.queue
            .append(event.container_id.clone(), move || async move {
                client.apply_event(event).await;
            });
    }

    async fn apply_event(&self, event: Event) {
        let id = event.container_id.clone();
        let _guard = self.registry.lock(&id).await;
        if !self.registry.contains(&id) {
            warn!(kind = ?event.kind, process = %event.process_id, "Dropping event: {}", Error::NotFound(id));
            return;
        }

        debug!(id = %id, kind = ?event.kind, process = %event.process_id, "Applying event");
        match event.kind {
            EventType::Start => {}
            EventType::Oom => {
                let _ = self.registry.with(&id, |c| c.oom = true);
                warn!(id = %id, "Container is out of memory");
                self.emit(StateChange::OutOfMemory { id }).await;
            }
            EventType::Exit if event.process_id == INIT_PROCESS => {
                self.apply_exit(&id, event.exit_status).await;
            }
            EventType::Exit | EventType::ExitProcess => {
                self.apply_process_exit(&id, &event.process_id, event.exit_status)
                    .await;
            }
            EventType::Pause => {
                let _ = self.registry.with(&id, |c| c.state = ContainerState::Paused);
                info!(id = %id, "Container paused");
                self.emit(StateChange::Paused { id: id.clone() }).await;
                let _ = self.registry.with(&id, |c| c.wake_waiters());
            }
            EventType::Resume => {
                let _ = self.registry.with(&id, |c| c.state = ContainerState::Running);
                info!(id = %id, "Container resumed");
                self.emit(StateChange::Resumed { id: id.clone() }).await;
                let _ = self.registry.with(&id, |c| c.wake_waiters());
            }
        }
    }

    async fn apply_exit(&self, id: &str, status: u32) {
        let Some(mut c) = self.registry.remove(id) else {
            return;
        };
        c.state = ContainerState::Exited;
        c.drop_waiters();

        // Unblock writers still attached to the output FIFOs.
        stdio::discard_fifos(&c.init_stdio, self.options.discard_timeout);
        for process in c.processes.iter() {
            stdio::discard_fifos(&process.stdio, self.options.discard_timeout);
        }
        container::clean(&c, self.options.keep_bundles).await;

        info!(id = %id, status, oom_killed = c.oom, "Container exited");
        self.emit(StateChange::Exited {
            id: id.to_string(),
            status,
            oom_killed: c.oom,
        })
        .await;
        self.notifiers.close(id);
    }

    async fn apply_process_exit(&self, id: &str, process_id: &str, status: u32) {
        let removed = self
            .registry
            .with(id, |c| c.processes.remove(process_id))
            .ok()
            .flatten();
        let Some(process) = removed else {
            warn!(id = %id, process = %process_id, "Dropping exit of unknown process");
            return;
        };
        process.remove_fifos().await;

        info!(id = %id, process = %process_id, status, "Process exited");
        self.emit(StateChange::ProcessExited {
            id: id.to_string(),
            process: process_id.to_string(),
            status,
        })
        .await;
    }

    /// Compare live containers with the shim and queue the events that were missed.
    ///
    /// Containers still starting are skipped: their create holds the id lock
    /// and the shim may not know them yet.
    pub async fn reconcile(self: &Arc<Self>) {
        for id in self.registry.ids() {
            let Ok(state) = self.registry.with(&id, |c| c.state) else {
                continue;
            };
            if !matches!(state, ContainerState::Running | ContainerState::Paused) {
                continue;
            }

            let missed = match self.shim.state(&id).await {
                Ok(None)
                | Ok(Some(ShimState {
                    status: ShimStatus::Stopped,
                    ..
                })) => Some(Event::exit(id.as_str(), INIT_PROCESS, LOST_EXIT_STATUS)),
                Ok(Some(shim_state)) => match (state, shim_state.status) {
                    (ContainerState::Running, ShimStatus::Paused) => {
                        Some(Event::new(EventType::Pause, id.as_str(), INIT_PROCESS))
                    }
                    (ContainerState::Paused, ShimStatus::Running) => {
                        Some(Event::new(EventType::Resume, id.as_str(), INIT_PROCESS))
                    }
                    _ => None,
                },
                Err(e) => {
                    warn!(id = %id, "Failed to query shim state: {}", e);
                    None
                }
            };

            if let Some(event) = missed {
                info!(id = %id, kind = ?event.kind, "Reconciling missed event");
                self.handle_event(event);
            }
        }
    }

    /// Consume shim events forever, resubscribing after every disconnect.
    pub async fn run_events(self: Arc<Self>) {
        loop {
            match self.shim.subscribe_events().await {
                Ok(mut stream) => {
                    info!("Subscribed to shim events");
                    self.reconcile().await;
                    while let Some(event) = stream.next().await {
                        self.handle_event(event);
                    }
                    warn!("Shim event stream ended");
                }
                Err(e) => warn!("Failed to subscribe to shim events: {}", e),
            }
            tokio::time::sleep(self.options.event_reconnect_delay).await;
        }
    }
}
