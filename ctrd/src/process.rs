//! Processes running inside a container.

use crate::stdio::{self, StdioPaths};
use std::collections::HashMap;

/// Friendly name of a container's first process.
pub const INIT_PROCESS: &str = "init";

/// A process started in a container: the init process or an exec'd one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Friendly process id, unique within the container.
    pub id: String,
    /// Owning container, referenced by id only.
    pub container_id: String,
    /// Host pid reported by the shim.
    pub system_pid: u32,
    pub stdio: StdioPaths,
}

/// Non-init processes of one container, keyed by process id.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, ProcessHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    /// Register a process. Returns the handle it replaced, if any.
    pub fn insert(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.processes.insert(handle.id.clone(), handle)
    }

    pub fn remove(&mut self, id: &str) -> Option<ProcessHandle> {
        self.processes.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.processes.values()
    }
}

impl ProcessHandle {
    /// Remove the process's FIFO files.
    pub async fn remove_fifos(&self) {
        stdio::remove_fifos(&self.stdio).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn handle(id: &str, pid: u32) -> ProcessHandle {
        ProcessHandle {
            id: id.to_string(),
            container_id: "c1".to_string(),
            system_pid: pid,
            stdio: StdioPaths::in_dir(Path::new("/run/ctrd/c1"), id, false),
        }
    }

    #[test]
    fn test_registry_insert_remove() {
        let mut registry = ProcessRegistry::new();
        assert_eq!(registry.iter().count(), 0);

        assert!(registry.insert(handle("p2", 11)).is_none());
        assert!(registry.insert(handle("p1", 10)).is_none());
        let mut ids: Vec<_> = registry.iter().map(|p| p.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["p1", "p2"]);

        let replaced = registry.insert(handle("p1", 12)).unwrap();
        assert_eq!(replaced.system_pid, 10);
        assert!(registry.iter().any(|p| p.id == "p1" && p.system_pid == 12));

        assert!(registry.remove("p1").is_some());
        assert!(registry.remove("p1").is_none());
        assert!(!registry.contains("p1"));
        assert_eq!(registry.iter().count(), 1);
    }
}
