//! ctrd - container lifecycle supervisor.
//!
//! Supervises containers and their processes on top of an out-of-process
//! runtime shim.
//!
//! ## Architecture
//!
//! - **Supervisor**: Single task loop, owns the container records
//! - **Runtime client**: Live container state, per-id locks, shim event handling
//! - **Shim**: Creates the actual containers (`RuntimeShim` drives youki/runc)
//!
//! Shim events are applied strictly in order per container through a serial
//! queue and reported back to the supervisor as state changes.

pub mod bundle;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod notifier;
pub mod process;
pub mod queue;
pub mod registry;
pub mod shim;
pub mod spec;
pub mod stdio;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};

use crate::client::{ClientOptions, RuntimeClient};
use crate::shim::Shim;
use crate::supervisor::{Supervisor, SupervisorHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Handles to the running ctrd services.
pub struct Services {
    pub supervisor: SupervisorHandle,
    pub client: Arc<RuntimeClient>,
    supervisor_task: JoinHandle<()>,
    events_task: JoinHandle<()>,
}

impl Services {
    /// Stop consuming shim events and wait for the supervisor loop to drain.
    pub async fn shutdown(self) {
        self.events_task.abort();
        drop(self.supervisor);
        if let Err(e) = self.supervisor_task.await {
            tracing::warn!("Supervisor task failed: {}", e);
        }
        info!("ctrd services stopped");
    }
}

/// Initialize the supervisor, the runtime client and the event loop.
pub async fn initialize_services(config: &Config, shim: Arc<dyn Shim>) -> anyhow::Result<Services> {
    info!("Initializing ctrd services");

    tokio::fs::create_dir_all(&config.state_dir).await?;

    let (changes_tx, changes_rx) = mpsc::channel(config.task_queue_depth);
    let client = RuntimeClient::new(shim, ClientOptions::from(config), changes_tx.clone());

    let (supervisor, handle) = Supervisor::new(
        client.clone(),
        changes_rx,
        changes_tx,
        config.default_runtime(),
        config.task_queue_depth,
    );
    let supervisor_task = tokio::spawn(supervisor.run());
    info!("Supervisor initialized");

    let events_task = tokio::spawn(client.clone().run_events());
    info!("Event loop initialized");

    Ok(Services {
        supervisor: handle,
        client,
        supervisor_task,
        events_task,
    })
}
