//! Compute worker lifecycle: socket setup, spawn, accept, teardown
//!
//! The orchestrator owns the rendezvous point: it creates a private
//! directory under the user's runtime dir, listens on a Unix socket
//! inside it, spawns the worker binary with the socket path as its
//! argument, and accepts exactly one connection. The worker's stdin is
//! held open as a liveness signal; closing it asks the worker to exit.
//!
//! Teardown runs the same way on every exit path: shut the multiplexer,
//! close stdin, drop the listener, wait for the child with a bound,
//! SIGKILL on timeout, then remove the socket file and directory. After
//! teardown a zero-signal probe of the worker PID reports no such
//! process.
//!
//! The listener outlives any one worker connection: if the worker dies
//! and is respawned, a second accept on the same listener works.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStdin, Command};

use crate::compute::mux::Multiplexer;
use crate::error::{Result, WeaveError};

/// Name of the private directory created under the runtime dir.
const SOCKET_DIR_NAME: &str = "weave";

/// Socket filename inside the private directory.
const SOCKET_FILE_NAME: &str = "compute.sock";

/// Settings for bringing up the compute worker.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Path to the worker executable
    pub worker_path: PathBuf,
    /// How long to wait for the worker to connect after spawn
    pub accept_timeout: Duration,
    /// How long to wait for the worker to exit before SIGKILL
    pub shutdown_timeout: Duration,
    /// Upper bound on inbound frame payloads
    pub max_payload: u32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from("sd35-worker"),
            accept_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_payload: crate::compute::frame::MAX_PAYLOAD_LEN,
        }
    }
}

/// A running compute worker and its connection.
#[derive(Debug)]
pub struct ComputeWorker {
    /// Multiplexer over the worker's single connection
    pub mux: Arc<Multiplexer>,
    child: Child,
    stdin: Option<ChildStdin>,
    listener: Option<UnixListener>,
    socket_dir: PathBuf,
    shutdown_timeout: Duration,
}

/// Resolves the private socket directory under `XDG_RUNTIME_DIR`.
///
/// # Errors
///
/// Returns [`WeaveError::XdgNotSet`] when the runtime directory cannot
/// be determined (the environment variable is unset).
pub fn socket_dir() -> Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .and_then(|dirs| dirs.runtime_dir().map(Path::to_path_buf))
        .ok_or(WeaveError::XdgNotSet)?;
    Ok(base.join(SOCKET_DIR_NAME))
}

/// Creates the private directory (0700) and binds the listener.
///
/// A stale socket file from a previous crash is removed first; the bind
/// would otherwise fail with `AddrInUse`.
pub fn bind_listener(dir: &Path) -> Result<(UnixListener, PathBuf)> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;

    let socket_path = dir.join(SOCKET_FILE_NAME);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    Ok((listener, socket_path))
}

/// Waits for exactly one connection, bounded by `timeout`.
pub async fn accept_connection(listener: &UnixListener, timeout: Duration) -> Result<UnixStream> {
    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((stream, _addr))) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_elapsed) => Err(WeaveError::Internal(format!(
            "compute worker did not connect within {:?}",
            timeout
        ))
        .into()),
    }
}

/// Spawns the worker and waits for its one connection.
///
/// The worker is invoked as `<worker_path> <socket_path>` with all
/// three stdio handles piped. Stdout and stderr are drained by
/// background tasks into the log; neither is an error condition.
///
/// # Errors
///
/// - [`WeaveError::XdgNotSet`] if no runtime directory exists.
/// - [`WeaveError::ComputeBinaryNotFound`] if the executable is
///   missing.
/// - [`WeaveError::Internal`] if the worker does not connect within
///   the accept timeout (the spawned child is killed first).
pub async fn spawn_worker(config: &ComputeConfig) -> Result<ComputeWorker> {
    let dir = socket_dir()?;
    let (listener, socket_path) = bind_listener(&dir)?;

    tracing::info!(
        worker = %config.worker_path.display(),
        socket = %socket_path.display(),
        "spawning compute worker"
    );

    let spawned = Command::new(&config.worker_path)
        .arg(&socket_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            drop(listener);
            cleanup_socket(&dir);
            let error = if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::from(WeaveError::ComputeBinaryNotFound(
                    config.worker_path.display().to_string(),
                ))
            } else {
                anyhow::Error::from(WeaveError::Io(e))
            };
            return Err(error);
        }
    };

    let stdin = child.stdin.take();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "weave::compute::worker", "worker stdout: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "weave::compute::worker", "worker stderr: {}", line);
            }
        });
    }

    let stream = match accept_connection(&listener, config.accept_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            // The worker never connected; don't leave it running.
            let _ = child.start_kill();
            let _ = child.wait().await;
            cleanup_socket(&dir);
            return Err(e);
        }
    };

    tracing::info!("compute worker connected");
    let mux = Multiplexer::new(stream, config.max_payload);

    Ok(ComputeWorker {
        mux,
        child,
        stdin,
        listener: Some(listener),
        socket_dir: dir,
        shutdown_timeout: config.shutdown_timeout,
    })
}

impl ComputeWorker {
    /// The worker's OS process id, if it has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Accepts a replacement connection on the original listener.
    ///
    /// Supports worker respawn without rebinding: the listener stays
    /// valid across connections. The previous multiplexer (if any) is
    /// shut down and replaced.
    pub async fn accept_replacement(&mut self, timeout: Duration) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| WeaveError::Internal("listener already closed".to_string()))?;
        let stream = accept_connection(listener, timeout).await?;
        self.mux.shutdown();
        self.mux = Multiplexer::new(stream, crate::compute::frame::MAX_PAYLOAD_LEN);
        Ok(())
    }

    /// Tears the worker down, guaranteed effects on every path:
    /// multiplexer closed, stdin closed, listener closed, child exited
    /// (SIGKILL after the bounded wait), socket file and directory
    /// removed.
    pub async fn teardown(mut self) -> Result<()> {
        self.mux.shutdown();

        // Closing stdin asks the worker to exit.
        drop(self.stdin.take());
        drop(self.listener.take());

        match tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("compute worker exited: {}", status);
            }
            Ok(Err(e)) => {
                tracing::warn!("wait for compute worker failed: {}", e);
            }
            Err(_elapsed) => {
                tracing::warn!(
                    "compute worker ignored shutdown for {:?}, killing",
                    self.shutdown_timeout
                );
                let _ = self.child.kill().await;
            }
        }

        cleanup_socket(&self.socket_dir);
        Ok(())
    }
}

/// Removes the socket file and its directory, logging failures.
fn cleanup_socket(dir: &Path) {
    let socket_path = dir.join(SOCKET_FILE_NAME);
    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {}", socket_path.display(), e);
        }
    }
    if let Err(e) = std::fs::remove_dir(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Zero-signal liveness probe: true while `pid` names a live process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
