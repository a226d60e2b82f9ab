//! Test helpers for ctrd integration tests.
//!
//! `FakeShim` stands in for the runtime: it hands out pids, records every
//! call and lets tests inject events or drop the event subscription.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ctrd::client::StateChange;
use ctrd::error::{Error, Result};
use ctrd::shim::{
    AddProcessRequest, CreateRequest, Event, EventStream, EventType, Shim, ShimState, ShimStatus,
    Stats,
};
use ctrd::{Config, Services, initialize_services};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory shim.
pub struct FakeShim {
    events: Mutex<broadcast::Sender<Event>>,
    next_pid: AtomicU32,
    calls: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, ShimState>>,
    fail_create: AtomicBool,
    create_delay: Mutex<Duration>,
}

impl FakeShim {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            events: Mutex::new(events),
            next_pid: AtomicU32::new(1000),
            calls: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Deliver an event to current subscribers.
    pub fn emit(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }

    pub fn emit_exit(&self, id: &str, process_id: &str, status: u32) {
        if process_id == "init" {
            self.states.lock().unwrap().remove(id);
        }
        self.emit(Event::exit(id, process_id, status));
    }

    /// Make the next create fail at the shim.
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    /// Forget a container as if it died while nobody was listening.
    pub fn forget(&self, id: &str) {
        self.states.lock().unwrap().remove(id);
    }

    /// End every current event stream.
    pub fn disconnect(&self) {
        let (events, _) = broadcast::channel(1024);
        *self.events.lock().unwrap() = events;
    }

    pub fn subscribers(&self) -> usize {
        self.events.lock().unwrap().receiver_count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn set_status(&self, id: &str, status: ShimStatus) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(id)
            .ok_or_else(|| Error::ipc(format!("container {id} does not exist")))?;
        state.status = status;
        Ok(())
    }
}

#[async_trait]
impl Shim for FakeShim {
    async fn create_container(&self, request: CreateRequest) -> Result<u32> {
        let delay = *self.create_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.record(format!("create {}", request.id));

        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::ipc("runtime create failed"));
        }
        let pid = self.next_pid();
        self.states.lock().unwrap().insert(
            request.id.clone(),
            ShimState {
                status: ShimStatus::Running,
                pid,
            },
        );
        self.emit(Event::new(EventType::Start, request.id, "init"));
        Ok(pid)
    }

    async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        self.record(format!("exec {} {}", request.id, request.process_id));
        Ok(self.next_pid())
    }

    async fn signal(&self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        self.record(format!("signal {id} {process_id} {signal}"));
        Ok(())
    }

    async fn close_stdin(&self, id: &str, process_id: &str) -> Result<()> {
        self.record(format!("close_stdin {id} {process_id}"));
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.set_status(id, ShimStatus::Paused)?;
        self.emit(Event::new(EventType::Pause, id, "init"));
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.set_status(id, ShimStatus::Running)?;
        self.emit(Event::new(EventType::Resume, id, "init"));
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Stats> {
        Ok(Stats {
            read_at: Utc::now(),
            cpu_usage_ns: 1_000,
            memory_usage_bytes: 4096,
            memory_limit_bytes: 8192,
            pids: 1,
            raw: serde_json::json!({"type": "stats", "id": id}),
        })
    }

    async fn state(&self, id: &str) -> Result<Option<ShimState>> {
        Ok(self.states.lock().unwrap().get(id).copied())
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        let mut rx = self.events.lock().unwrap().subscribe();
        Ok(Box::pin(async_stream::stream! {
            while let Ok(event) = rx.recv().await {
                yield event;
            }
        }))
    }
}

/// Running services on a fake shim, with a private state dir.
pub struct TestEnv {
    pub dir: TempDir,
    pub shim: Arc<FakeShim>,
    pub services: Services,
}

impl TestEnv {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            state_dir: dir.path().join("state"),
            event_reconnect_delay_ms: 20,
            discard_timeout_ms: 100,
            ..Config::default()
        };
        let shim = FakeShim::new();
        let services = initialize_services(&config, shim.clone()).await.unwrap();

        wait_until(|| shim.subscribers() > 0).await;
        Self { dir, shim, services }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// Write a minimal bundle for `id` and return its path.
    pub fn bundle(&self, id: &str) -> PathBuf {
        write_bundle(&self.dir.path().join("bundles").join(id))
    }
}

pub fn write_bundle(path: &Path) -> PathBuf {
    std::fs::create_dir_all(path.join("rootfs")).unwrap();
    let spec = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": {"path": "rootfs"},
        "process": {"args": ["sh"], "cwd": "/"},
        "linux": {"namespaces": [{"type": "pid"}, {"type": "mount"}]}
    });
    std::fs::write(path.join("config.json"), spec.to_string()).unwrap();
    path.to_path_buf()
}

/// Poll `cond` until it holds, panicking after [`TIMEOUT`].
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next state change matching `pred`, skipping others.
pub async fn next_change(
    rx: &mut broadcast::Receiver<StateChange>,
    pred: impl Fn(&StateChange) -> bool,
) -> StateChange {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let change = rx.recv().await.expect("state change channel closed");
            if pred(&change) {
                return change;
            }
        }
    })
    .await
    .expect("state change not received in time")
}
