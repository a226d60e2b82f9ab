//! Live container table and per-id locks.

use crate::container::Container;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Owns the live containers and the lock serializing operations per id.
///
/// The table mutex only guards membership and is never held across an await.
/// The per-id lock is held for the duration of a lifecycle operation.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: Mutex<HashMap<String, Container>>,
    locks: LockTable,
}

/// Exclusive hold on one container id. Released on drop.
pub struct IdGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        if let Some(entry) = locks.get(&self.id)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(&self.id);
        }
    }
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting for the current holder.
    pub async fn lock(&self, id: &str) -> IdGuard {
        let mutex = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        IdGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Container>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    /// Register a container. At most one live entry per id.
    pub fn insert(&self, container: Container) -> Result<()> {
        let mut table = self.table();
        if table.contains_key(&container.id) {
            return Err(Error::AlreadyActive(container.id));
        }
        table.insert(container.id.clone(), container);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Container> {
        self.table().remove(id)
    }

    /// Run `f` on the live entry for `id`.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut Container) -> R) -> Result<R> {
        self.table()
            .get_mut(id)
            .map(f)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Ids that currently have a lock entry, held or awaited.
    pub fn locked_ids(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
