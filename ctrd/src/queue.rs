//! Per-key serial execution of callbacks.
//!
//! Callbacks appended under the same key run one at a time in the order they
//! were appended. Callbacks under different keys run concurrently. The chain
//! for a key is fixed at `append` time, so the order never depends on how the
//! runtime schedules the spawned tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::error;

/// Completion signal of the most recently appended callback for a key.
struct Tail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    tails: HashMap<String, Tail>,
}

/// Queue that serializes callbacks per key.
#[derive(Clone, Default)]
pub struct SerialQueue {
    inner: Arc<Mutex<Inner>>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `f` to run after every callback previously appended under `key`.
    ///
    /// Callbacks cannot fail outward. A callback that panics is logged and the
    /// next callback for the key still runs.
    pub fn append<F, Fut>(&self, key: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let (done_tx, done_rx) = oneshot::channel();

        let (seq, prev) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let prev = inner.tails.insert(key.clone(), Tail { seq, done: done_rx });
            (seq, prev)
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(prev) = prev {
                // A closed channel means the previous callback is gone too.
                let _ = prev.done.await;
            }

            if let Err(e) = tokio::spawn(f()).await {
                error!(key = %key, "Serialized callback failed: {}", e);
            }
            let _ = done_tx.send(());

            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.tails.get(&key).is_some_and(|tail| tail.seq == seq) {
                inner.tails.remove(&key);
            }
        });
    }

    /// Number of keys with callbacks queued or running.
    pub fn active_keys(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tails
            .len()
    }
}
