//! Named-pipe stdio for container processes.
//!
//! The engine creates one FIFO per stream next to the process state and
//! keeps the engine-side ends open. The shim opens the peer ends when it
//! launches the process. With a terminal only stdin and stdout exist.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions as StdOpenOptions;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// FIFO locations for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
}

impl StdioPaths {
    /// Default FIFO paths for `process` inside `dir`.
    pub fn in_dir(dir: &Path, process: &str, terminal: bool) -> Self {
        Self::default().or_defaults(dir, process, terminal)
    }

    /// Fill every unset path with its default under `dir`.
    ///
    /// A terminal multiplexes both output streams onto stdout, so stderr is
    /// dropped even when one was given.
    pub fn or_defaults(self, dir: &Path, process: &str, terminal: bool) -> Self {
        let fifo = |name: &str| dir.join(format!("{process}-{name}"));
        Self {
            stdin: Some(self.stdin.unwrap_or_else(|| fifo("stdin"))),
            stdout: Some(self.stdout.unwrap_or_else(|| fifo("stdout"))),
            stderr: if terminal {
                None
            } else {
                Some(self.stderr.unwrap_or_else(|| fifo("stderr")))
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .filter_map(|p| p.as_deref())
    }
}

/// Future run when stdin is closed after the process launch was acknowledged.
pub type CloseNotify = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Engine-side stdin of a process.
///
/// The first `close` closes the pipe right away. Telling the shim about it
/// waits until the launch was acknowledged (the gate fires), because the shim
/// rejects the notification before that. If the gate is dropped instead, the
/// launch failed and the notification is abandoned.
pub struct StdinWriter {
    inner: Option<pipe::Sender>,
    gate: Option<oneshot::Receiver<()>>,
    notify: Option<CloseNotify>,
}

impl StdinWriter {
    pub fn new(sender: pipe::Sender, gate: oneshot::Receiver<()>, notify: CloseNotify) -> Self {
        Self {
            inner: Some(sender),
            gate: Some(gate),
            notify: Some(notify),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Close stdin. Only the first call has an effect.
    pub fn close(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        if let (Some(gate), Some(notify)) = (self.gate.take(), self.notify.take()) {
            tokio::spawn(async move {
                if gate.await.is_ok() {
                    notify().await;
                }
            });
        }
    }
}

impl AsyncWrite for StdinWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.inner.as_mut() {
            Some(sender) => Pin::new(sender).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(sender) => Pin::new(sender).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

/// Engine-side ends of a process's FIFOs, handed to the attach callback.
pub struct IoPipe {
    pub stdin: StdinWriter,
    pub stdout: pipe::Receiver,
    pub stderr: Option<pipe::Receiver>,
}

impl IoPipe {
    /// Detach from the process: close stdin and drain the output streams.
    pub fn discard(mut self) {
        self.stdin.close();
        for mut rx in [Some(self.stdout), self.stderr].into_iter().flatten() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut rx, &mut tokio::io::sink()).await;
            });
        }
    }
}

/// Attach callback invoked with the opened FIFOs before the process is launched.
pub type StdioCallback = Box<dyn FnOnce(IoPipe) -> Result<()> + Send>;

/// Callback that discards all process I/O.
pub fn discard_stdio() -> StdioCallback {
    Box::new(|io: IoPipe| {
        io.discard();
        Ok(())
    })
}

/// Create the FIFO files. Existing FIFOs are reused.
pub fn create_fifos(paths: &StdioPaths) -> Result<()> {
    for path in paths.iter() {
        match mkfifo(path, Mode::S_IRWXU) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Create and open the engine-side ends of all FIFOs in `paths`.
///
/// Output streams are opened as non-blocking readers. Stdin is opened
/// read-write so the open does not wait for the shim to show up.
pub fn open_fifos(
    paths: &StdioPaths,
    gate: oneshot::Receiver<()>,
    notify: CloseNotify,
) -> Result<IoPipe> {
    create_fifos(paths)?;

    let stdin_path = required(&paths.stdin, "stdin")?;
    let stdout_path = required(&paths.stdout, "stdout")?;

    let stdout = pipe::OpenOptions::new().open_receiver(stdout_path)?;
    let stderr = match &paths.stderr {
        Some(path) => Some(pipe::OpenOptions::new().open_receiver(path)?),
        None => None,
    };
    let stdin = pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(stdin_path)?;

    Ok(IoPipe {
        stdin: StdinWriter::new(stdin, gate, notify),
        stdout,
        stderr,
    })
}

fn required<'a>(path: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("no {name} fifo"))))
}

/// Open the peer end of a FIFO with a blocking open, bounded by `timeout`.
///
/// A reader waits for a writer and vice versa. On timeout the FIFO is
/// briefly opened read-write so the stuck open completes instead of holding
/// a blocking thread forever.
pub async fn open_peer(path: &Path, write: bool, timeout: Duration) -> Result<std::fs::File> {
    let target = path.to_path_buf();
    let open = tokio::task::spawn_blocking(move || {
        StdOpenOptions::new()
            .read(!write)
            .write(write)
            .open(&target)
    });

    match tokio::time::timeout(timeout, open).await {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(e)) => Err(Error::Io(io::Error::other(e))),
        Err(_) => {
            let _ = StdOpenOptions::new().read(true).write(true).open(path);
            Err(Error::StdioOpenTimeout(path.to_path_buf()))
        }
    }
}

/// Drain the output FIFOs into a sink so writers still attached to them
/// do not block. Each drain stops after `timeout`.
pub fn discard_fifos(paths: &StdioPaths, timeout: Duration) {
    for path in [&paths.stdout, &paths.stderr].into_iter().flatten() {
        let mut rx = match pipe::OpenOptions::new().open_receiver(path) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(path = %path.display(), "Failed to open fifo for discarding: {}", e);
                continue;
            }
        };
        let path = path.clone();
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let drain = tokio::io::copy(&mut rx, &mut sink);
            match tokio::time::timeout(timeout, drain).await {
                Ok(Ok(n)) => debug!(path = %path.display(), bytes = n, "Discarded fifo output"),
                Ok(Err(e)) => debug!(path = %path.display(), "Fifo drain stopped: {}", e),
                Err(_) => debug!(path = %path.display(), "Fifo drain timed out"),
            }
        });
    }
}

/// Remove the FIFO files. Missing files are fine, other failures are logged.
pub async fn remove_fifos(paths: &StdioPaths) {
    for path in paths.iter() {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), "Failed to remove fifo: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn counting_notify(count: Arc<AtomicUsize>) -> CloseNotify {
        Box::new(move || {
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_default_paths() {
        let dir = Path::new("/run/ctrd/c1");
        let paths = StdioPaths::in_dir(dir, "init", false);
        assert_eq!(paths.stdin.as_deref(), Some(dir.join("init-stdin").as_path()));
        assert_eq!(paths.stderr.as_deref(), Some(dir.join("init-stderr").as_path()));

        let tty = StdioPaths {
            stdout: Some(PathBuf::from("/tmp/out")),
            ..Default::default()
        }
        .or_defaults(dir, "init", true);
        assert_eq!(tty.stdout.as_deref(), Some(Path::new("/tmp/out")));
        assert!(tty.stderr.is_none());
        assert_eq!(tty.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_open_and_stream() {
        let dir = TempDir::new().unwrap();
        let paths = StdioPaths::in_dir(dir.path(), "init", false);
        let (_gate_tx, gate_rx) = oneshot::channel();
        let mut io = open_fifos(&paths, gate_rx, Box::new(|| Box::pin(async {}))).unwrap();

        let timeout = Duration::from_secs(5);
        let mut shim_stdout = open_peer(paths.stdout.as_ref().unwrap(), true, timeout)
            .await
            .unwrap();
        shim_stdout.write_all(b"hello").unwrap();
        drop(shim_stdout);

        let mut out = Vec::new();
        io.stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        let shim_stdin = open_peer(paths.stdin.as_ref().unwrap(), false, timeout)
            .await
            .unwrap();
        io.stdin.write_all(b"input").await.unwrap();
        io.stdin.close();
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut &shim_stdin, &mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(read, b"input");
    }

    #[tokio::test]
    async fn test_stdin_close_waits_for_gate() {
        let dir = TempDir::new().unwrap();
        let paths = StdioPaths::in_dir(dir.path(), "init", true);
        let count = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut io = open_fifos(&paths, gate_rx, counting_notify(count.clone())).unwrap();
        assert!(io.stderr.is_none());

        io.stdin.close();
        io.stdin.close();
        assert!(io.stdin.is_closed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        gate_tx.send(()).unwrap();
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stdin_close_abandoned_when_gate_dropped() {
        let dir = TempDir::new().unwrap();
        let paths = StdioPaths::in_dir(dir.path(), "init", false);
        let count = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let mut io = open_fifos(&paths, gate_rx, counting_notify(count.clone())).unwrap();

        io.stdin.close();
        drop(gate_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(io.stdin.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_open_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lonely");
        create_fifos(&StdioPaths {
            stdout: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();

        let err = open_peer(&path, true, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StdioOpenTimeout(p) if p == path));
    }

    #[tokio::test]
    async fn test_remove_fifos_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let paths = StdioPaths::in_dir(dir.path(), "p1", false);
        create_fifos(&paths).unwrap();
        remove_fifos(&paths).await;
        remove_fifos(&paths).await;
        assert!(paths.iter().all(|p| !p.exists()));
    }
}
