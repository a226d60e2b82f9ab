//! Shim backed by an OCI runtime binary (youki, runc, ...).
//!
//! Every request becomes a runtime subcommand. Process exits are observed
//! with waitpid (ctrd runs as child subreaper) and OOM notifications come from
//! the runtime's `events` stream. Both are published on a broadcast channel.

use super::{
    AddProcessRequest, CreateRequest, Event, EventStream, EventType, Runtime, Shim, ShimState,
    ShimStatus, Stats,
};
use crate::error::{Error, Result};
use crate::process::INIT_PROCESS;
use crate::stdio;
use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What the shim remembers about a container it created.
#[derive(Debug, Clone)]
struct Tracked {
    runtime: Runtime,
    /// Exec'd processes: process id -> host pid.
    processes: HashMap<String, u32>,
}

type TrackedMap = Arc<Mutex<HashMap<String, Tracked>>>;

/// Shim that drives an OCI runtime command line.
pub struct RuntimeShim {
    /// Root directory for the runtime's own state (`--root`).
    root: Option<PathBuf>,
    stdio_timeout: Duration,
    containers: TrackedMap,
    events: broadcast::Sender<Event>,
}

impl RuntimeShim {
    pub fn new(root: Option<PathBuf>, stdio_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            root,
            stdio_timeout,
            containers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn command(&self, runtime: &Runtime) -> Command {
        runtime_command(runtime, self.root.as_deref())
    }

    fn tracked(&self, id: &str) -> Result<Tracked> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Run a short-lived runtime subcommand and return its stdout.
    async fn run(&self, runtime: &Runtime, args: &[&str]) -> Result<Vec<u8>> {
        debug!(
            runtime = %runtime.binary.display(),
            "Executing runtime {}",
            args.join(" ")
        );

        let output = self
            .command(runtime)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::ipc(format!(
                    "failed to execute {}: {e}",
                    runtime.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err_msg = format!(
                "runtime {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            );
            warn!("{err_msg}");
            return Err(Error::Ipc(err_msg));
        }

        Ok(output.stdout)
    }

    /// Spawn a runtime command wired to the process FIFOs and wait for it.
    async fn run_attached(&self, mut cmd: Command, stdio_paths: &stdio::StdioPaths) -> Result<()> {
        let open = |path: &Option<PathBuf>, write: bool| {
            let path = path.clone();
            let timeout = self.stdio_timeout;
            async move {
                match path {
                    Some(path) => Ok::<_, Error>(Some(stdio::open_peer(&path, write, timeout).await?)),
                    None => Ok(None),
                }
            }
        };
        let stdin = open(&stdio_paths.stdin, false).await?;
        let stdout = open(&stdio_paths.stdout, true).await?;
        let stderr = open(&stdio_paths.stderr, true).await?;

        cmd.stdin(stdin.map_or_else(Stdio::null, Stdio::from));
        cmd.stdout(stdout.map_or_else(Stdio::null, Stdio::from));
        cmd.stderr(stderr.map_or_else(Stdio::null, Stdio::from));

        let status = cmd
            .status()
            .await
            .map_err(|e| Error::ipc(format!("failed to spawn runtime: {e}")))?;
        if !status.success() {
            return Err(Error::ipc(format!("runtime exited with {status}")));
        }
        Ok(())
    }

    fn publish(&self, event: Event) {
        publish(&self.events, event);
    }
}

fn runtime_command(runtime: &Runtime, root: Option<&Path>) -> Command {
    let mut cmd = Command::new(&runtime.binary);
    cmd.args(&runtime.args);
    if let Some(root) = root {
        cmd.arg("--root").arg(root);
    }
    cmd
}

fn publish(events: &broadcast::Sender<Event>, event: Event) {
    // No subscribers is not an error: the client resubscribes and reconciles.
    if events.send(event).is_err() {
        debug!("No event subscribers");
    }
}

async fn read_pid_file(path: &Path) -> Result<u32> {
    let pid_str = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::ipc(format!("could not read pid file {}: {e}", path.display())))?;
    pid_str
        .trim()
        .parse::<u32>()
        .map_err(|e| Error::ipc(format!("failed to parse pid: {e}")))
}

/// Map a wait status to the exit status reported in events.
fn exit_status(status: &WaitStatus) -> u32 {
    match status {
        WaitStatus::Exited(_, code) => *code as u32,
        WaitStatus::Signaled(_, signal, _) => 128 + *signal as u32,
        _ => 255,
    }
}

fn is_process_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

/// Wait for a process to exit and return its exit status.
async fn wait_for_exit(pid: u32) -> u32 {
    let target = Pid::from_raw(pid as i32);
    let waited = tokio::task::spawn_blocking(move || waitpid(target, None))
        .await
        .unwrap_or(Err(Errno::ECHILD));

    match waited {
        Ok(status) => exit_status(&status),
        Err(Errno::ECHILD) => {
            // Not our child (no subreaper): the status is lost, poll for the exit.
            while is_process_alive(pid) {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            255
        }
        Err(e) => {
            error!(pid, "waitpid failed: {}", e);
            255
        }
    }
}

/// Watch a process of container `id` and publish its exit.
///
/// When init exits the runtime state is deleted before the event goes out,
/// so a later create with the same id starts from a clean slate.
fn spawn_exit_watcher(
    id: String,
    process_id: String,
    pid: u32,
    root: Option<PathBuf>,
    containers: TrackedMap,
    events: broadcast::Sender<Event>,
) {
    tokio::spawn(async move {
        let status = wait_for_exit(pid).await;
        info!(id = %id, process = %process_id, pid, status, "Process exited");

        if process_id == INIT_PROCESS {
            let tracked = containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(tracked) = tracked {
                let deleted = runtime_command(&tracked.runtime, root.as_deref())
                    .args(["delete", "--force", &id])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(e) = deleted {
                    warn!(id = %id, "Failed to delete runtime state: {}", e);
                }
            }
        } else if let Some(tracked) = containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            tracked.processes.remove(&process_id);
        }

        publish(&events, Event::exit(id, process_id, status));
    });
}

#[derive(Deserialize)]
struct RuntimeEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    data: Value,
}

/// Follow `<runtime> events <id>` and publish OOM notifications.
fn spawn_oom_monitor(
    id: String,
    runtime: Runtime,
    root: Option<PathBuf>,
    events: broadcast::Sender<Event>,
) {
    tokio::spawn(async move {
        let child = runtime_command(&runtime, root.as_deref())
            .args(["events", &id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(id = %id, "Failed to start OOM monitor: {}", e);
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            return;
        };

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<RuntimeEvent>(&line) {
                Ok(ev) if ev.kind == "oom" => {
                    let target = if ev.id.is_empty() { id.clone() } else { ev.id };
                    publish(&events, Event::new(EventType::Oom, target, INIT_PROCESS));
                }
                Ok(_) => {}
                Err(e) => debug!(id = %id, "Ignoring runtime event line: {}", e),
            }
        }
        debug!(id = %id, "OOM monitor finished");
    });
}

fn parse_stats(raw: Value) -> Result<Stats> {
    let event: RuntimeEvent = serde_json::from_value(raw.clone())?;
    if event.kind != "stats" {
        return Err(Error::ipc(format!("unexpected runtime event {}", event.kind)));
    }
    let num = |ptr: &str| event.data.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
    Ok(Stats {
        read_at: Utc::now(),
        cpu_usage_ns: num("/cpu/usage/total"),
        memory_usage_bytes: num("/memory/usage/usage"),
        memory_limit_bytes: num("/memory/usage/limit"),
        pids: num("/pids/current"),
        raw,
    })
}

#[derive(Deserialize)]
struct RuntimeState {
    status: ShimStatus,
    #[serde(default)]
    pid: u32,
}

#[async_trait]
impl Shim for RuntimeShim {
    async fn create_container(&self, request: CreateRequest) -> Result<u32> {
        if request.terminal {
            return Err(Error::ipc("terminal containers need a console socket shim"));
        }

        let id = request.id.clone();
        let pid_file = request.bundle.join("init.pid");

        let mut cmd = self.command(&request.runtime);
        match &request.checkpoint {
            Some(image) => {
                cmd.args(["restore", "--detach", "--image-path"]).arg(image);
            }
            None => {
                cmd.arg("create");
            }
        }
        cmd.arg("--bundle")
            .arg(&request.bundle)
            .arg("--pid-file")
            .arg(&pid_file);
        if request.no_pivot_root {
            cmd.arg("--no-pivot");
        }
        cmd.arg(&id);

        info!(id = %id, bundle = %request.bundle.display(), "Creating container");
        self.run_attached(cmd, &request.stdio).await?;
        let pid = read_pid_file(&pid_file).await?;

        if request.checkpoint.is_none()
            && let Err(e) = self.run(&request.runtime, &["start", &id]).await
        {
            let _ = self.run(&request.runtime, &["delete", "--force", &id]).await;
            return Err(e);
        }

        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                Tracked {
                    runtime: request.runtime.clone(),
                    processes: HashMap::new(),
                },
            );

        spawn_exit_watcher(
            id.clone(),
            INIT_PROCESS.to_string(),
            pid,
            self.root.clone(),
            self.containers.clone(),
            self.events.clone(),
        );
        spawn_oom_monitor(
            id.clone(),
            request.runtime,
            self.root.clone(),
            self.events.clone(),
        );

        info!(id = %id, pid, "Container started");
        self.publish(Event::new(EventType::Start, id, INIT_PROCESS));
        Ok(pid)
    }

    async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        let tracked = self.tracked(&request.id)?;
        if request.spec.terminal {
            return Err(Error::ipc("terminal processes need a console socket shim"));
        }

        let spec_path = request
            .bundle
            .join(format!("{}-process.json", request.process_id));
        let pid_file = request.bundle.join(format!("{}.pid", request.process_id));
        tokio::fs::write(&spec_path, serde_json::to_vec(&request.spec)?).await?;

        let mut cmd = self.command(&tracked.runtime);
        cmd.args(["exec", "--detach", "--process"])
            .arg(&spec_path)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(&request.id);

        info!(id = %request.id, process = %request.process_id, "Executing process");
        self.run_attached(cmd, &request.stdio).await?;
        let pid = read_pid_file(&pid_file).await?;

        if let Some(tracked) = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&request.id)
        {
            tracked.processes.insert(request.process_id.clone(), pid);
        }

        spawn_exit_watcher(
            request.id,
            request.process_id,
            pid,
            self.root.clone(),
            self.containers.clone(),
            self.events.clone(),
        );
        Ok(pid)
    }

    async fn signal(&self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        let tracked = self.tracked(id)?;
        if process_id == INIT_PROCESS {
            self.run(&tracked.runtime, &["kill", id, &signal.to_string()])
                .await?;
            return Ok(());
        }

        let pid = tracked
            .processes
            .get(process_id)
            .copied()
            .ok_or_else(|| Error::ProcessNotFound {
                container: id.to_string(),
                process: process_id.to_string(),
            })?;
        let signal = Signal::try_from(signal)?;
        kill(Pid::from_raw(pid as i32), signal)?;
        Ok(())
    }

    async fn close_stdin(&self, id: &str, process_id: &str) -> Result<()> {
        // The engine held the only writer, so the process already sees EOF.
        debug!(id = %id, process = %process_id, "Stdin closed");
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let tracked = self.tracked(id)?;
        self.run(&tracked.runtime, &["pause", id]).await?;
        self.publish(Event::new(EventType::Pause, id, INIT_PROCESS));
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let tracked = self.tracked(id)?;
        self.run(&tracked.runtime, &["resume", id]).await?;
        self.publish(Event::new(EventType::Resume, id, INIT_PROCESS));
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Stats> {
        let tracked = self.tracked(id)?;
        let out = self.run(&tracked.runtime, &["events", "--stats", id]).await?;
        parse_stats(serde_json::from_slice(&out)?)
    }

    async fn state(&self, id: &str) -> Result<Option<ShimState>> {
        let runtime = match self.tracked(id) {
            Ok(tracked) => tracked.runtime,
            Err(_) => return Ok(None),
        };
        let out = match self.run(&runtime, &["state", id]).await {
            Ok(out) => out,
            // The runtime exits non-zero for unknown containers.
            Err(Error::Ipc(msg)) if !msg.starts_with("failed to execute") => return Ok(None),
            Err(e) => return Err(e),
        };
        let state: RuntimeState = serde_json::from_slice(&out)?;
        Ok(Some(ShimState {
            status: state.status,
            pid: state.pid,
        }))
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        let mut rx = self.events.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Events were lost; end the stream so the client reconciles.
                        warn!(missed, "Event subscriber lagged");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    /// Shell script standing in for the runtime binary. It is passed as the
    /// first global argument, so `$1` is the subcommand.
    fn fake_runtime(dir: &Path, body: &str) -> Runtime {
        let path = dir.join("runtime.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        Runtime {
            binary: PathBuf::from("/bin/sh"),
            args: vec![path.to_string_lossy().into_owned()],
        }
    }

    fn track(shim: &RuntimeShim, id: &str, runtime: Runtime) {
        shim.containers.lock().unwrap().insert(
            id.to_string(),
            Tracked {
                runtime,
                processes: HashMap::new(),
            },
        );
    }

    #[test]
    fn test_exit_status_mapping() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_status(&WaitStatus::Exited(pid, 3)), 3);
        assert_eq!(
            exit_status(&WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            137
        );
        assert_eq!(exit_status(&WaitStatus::StillAlive), 255);
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(json!({
            "type": "stats",
            "id": "c1",
            "data": {
                "cpu": {"usage": {"total": 1500}},
                "memory": {"usage": {"usage": 4096, "limit": 8192}},
                "pids": {"current": 3}
            }
        }))
        .unwrap();
        assert_eq!(stats.cpu_usage_ns, 1500);
        assert_eq!(stats.memory_usage_bytes, 4096);
        assert_eq!(stats.memory_limit_bytes, 8192);
        assert_eq!(stats.pids, 3);

        assert!(parse_stats(json!({"type": "oom", "id": "c1"})).is_err());
    }

    #[tokio::test]
    async fn test_state_of_known_and_unknown_container() {
        let dir = TempDir::new().unwrap();
        let runtime = fake_runtime(
            dir.path(),
            r#"if [ "$1" = "state" ] && [ "$2" = "c1" ]; then
  echo '{"id":"c1","status":"paused","pid":42}'
  exit 0
fi
echo "container $2 does not exist" >&2
exit 1"#,
        );
        let shim = RuntimeShim::new(None, Duration::from_secs(1));
        track(&shim, "c1", runtime.clone());
        track(&shim, "c2", runtime);

        let state = shim.state("c1").await.unwrap().unwrap();
        assert_eq!(state.status, ShimStatus::Paused);
        assert_eq!(state.pid, 42);

        assert!(shim.state("c2").await.unwrap().is_none());
        assert!(shim.state("untracked").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_publishes_event() {
        let dir = TempDir::new().unwrap();
        let runtime = fake_runtime(dir.path(), "exit 0");
        let shim = RuntimeShim::new(None, Duration::from_secs(1));
        track(&shim, "c1", runtime);

        let mut events = shim.subscribe_events().await.unwrap();
        shim.pause("c1").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventType::Pause);
        assert_eq!(event.container_id, "c1");
    }

    #[tokio::test]
    async fn test_runtime_failure_is_ipc_error() {
        let dir = TempDir::new().unwrap();
        let runtime = fake_runtime(dir.path(), "echo 'no such container' >&2; exit 1");
        let shim = RuntimeShim::new(None, Duration::from_secs(1));
        track(&shim, "c1", runtime);

        let err = shim.signal("c1", INIT_PROCESS, 15).await.unwrap_err();
        match err {
            Error::Ipc(msg) => assert!(msg.contains("no such container")),
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            shim.signal("c1", "p1", 15).await,
            Err(Error::ProcessNotFound { .. })
        ));
        assert!(matches!(
            shim.pause("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
