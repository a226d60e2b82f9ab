//! One-shot exit broadcast per container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Broadcasts the exit of a single container to any number of waiters.
///
/// Closing is idempotent: the first `close` flips the done flag and wakes
/// every waiter, later calls do nothing.
#[derive(Debug, Default)]
pub struct ExitNotifier {
    done: AtomicBool,
    notify: Notify,
}

impl ExitNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the notifier. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait until the notifier is closed. Never returns if it never is.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close cannot slip between.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Exit notifiers of the live containers, keyed by container id.
#[derive(Debug, Default)]
pub struct ExitNotifiers {
    inner: Mutex<HashMap<String, Arc<ExitNotifier>>>,
}

impl ExitNotifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the notifier for `id`, creating it if needed.
    pub fn get_or_create(&self, id: &str) -> Arc<ExitNotifier> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            inner
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ExitNotifier::new())),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<ExitNotifier>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Remove the notifier for `id` and close it.
    pub fn close(&self, id: &str) {
        let notifier = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(notifier) = notifier {
            notifier.close();
        }
    }
}
