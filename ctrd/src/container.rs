//! Per-container runtime state.

use crate::process::ProcessRegistry;
use crate::shim::Runtime;
use crate::stdio::{self, StdioPaths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::warn;

/// Lifecycle state of a container. Absent containers have no entry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Starting,
    Running,
    Paused,
    Exited,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct PauseWaiter {
    want: ContainerState,
    tx: oneshot::Sender<()>,
}

/// A live container as seen by the runtime client.
pub struct Container {
    pub id: String,
    /// `<state dir>/<id>`, holds the persisted spec and the FIFOs.
    pub dir: PathBuf,
    pub runtime: Runtime,
    pub state: ContainerState,
    /// Sticky until the container exits.
    pub oom: bool,
    pub init_pid: u32,
    pub init_stdio: StdioPaths,
    pub processes: ProcessRegistry,
    pause_waiters: Vec<PauseWaiter>,
}

impl Container {
    pub fn new(id: impl Into<String>, dir: PathBuf, runtime: Runtime, init_stdio: StdioPaths) -> Self {
        Self {
            id: id.into(),
            dir,
            runtime,
            state: ContainerState::Starting,
            oom: false,
            init_pid: 0,
            init_stdio,
            processes: ProcessRegistry::new(),
            pause_waiters: Vec::new(),
        }
    }

    /// Register interest in reaching `want`.
    ///
    /// The receiver fires once the matching event was applied, and errors if
    /// the container goes away first.
    pub fn wait_for(&mut self, want: ContainerState) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pause_waiters.push(PauseWaiter { want, tx });
        rx
    }

    /// Wake every waiter interested in the current state.
    pub fn wake_waiters(&mut self) {
        let state = self.state;
        let (ready, pending) = std::mem::take(&mut self.pause_waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|w| w.want == state);
        self.pause_waiters = pending;
        for waiter in ready {
            let _ = waiter.tx.send(());
        }
    }

    /// Fail all pending waiters.
    pub fn drop_waiters(&mut self) {
        self.pause_waiters.clear();
    }

}

/// Remove a container directory and everything in it. A missing directory is fine.
pub async fn clean_dir(dir: &std::path::Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Tear down an exited container's on-disk state.
///
/// With `keep_bundle` the directory and persisted spec stay for inspection,
/// only the FIFOs are removed.
pub async fn clean(container: &Container, keep_bundle: bool) {
    stdio::remove_fifos(&container.init_stdio).await;
    for process in container.processes.iter() {
        process.remove_fifos().await;
    }
    if keep_bundle {
        return;
    }
    if let Err(e) = clean_dir(&container.dir).await {
        warn!(id = %container.id, dir = %container.dir.display(), "Failed to clean container dir: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::INIT_PROCESS;
    use crate::spec::CONFIG_FILENAME;
    use tempfile::TempDir;

    fn container(dir: PathBuf) -> Container {
        let stdio = StdioPaths::in_dir(&dir, INIT_PROCESS, false);
        Container::new("c1", dir, Runtime::default(), stdio)
    }

    #[tokio::test]
    async fn test_waiters_woken_by_matching_state() {
        let mut c = container(PathBuf::from("/run/ctrd/c1"));
        c.state = ContainerState::Running;
        let mut paused = c.wait_for(ContainerState::Paused);
        let mut resumed = c.wait_for(ContainerState::Running);

        c.state = ContainerState::Paused;
        c.wake_waiters();
        assert!(paused.try_recv().is_ok());
        assert!(matches!(resumed.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        c.drop_waiters();
        assert!(resumed.await.is_err());
    }

    #[tokio::test]
    async fn test_clean_keeps_bundle_when_asked() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("c1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(CONFIG_FILENAME), b"{}").await.unwrap();
        let c = container(dir.clone());
        stdio::create_fifos(&c.init_stdio).unwrap();

        clean(&c, true).await;
        assert!(dir.join(CONFIG_FILENAME).exists());
        assert!(c.init_stdio.iter().all(|p| !p.exists()));

        clean(&c, false).await;
        assert!(!dir.exists());
        clean_dir(&dir).await.unwrap();
    }
}
