//! Request/response multiplexer for the compute worker socket
//!
//! One [`Multiplexer`] owns one connected stream for the life of the
//! connection. Callers submit framed requests via [`Multiplexer::send`]
//! and await the correlated response; correlation uses the 8-byte
//! little-endian request id at the start of every payload.
//!
//! A single reader task owns the read half: it decodes frames, looks up
//! the waiting caller by request id, and delivers the frame through a
//! one-shot channel. Delivery is non-blocking on the reader side; a
//! response with no waiter is dropped and logged (either a protocol
//! violation or a caller that cancelled and already cleaned up).
//!
//! Transport errors are terminal. When the reader exits (EOF, stream
//! error, malformed frame) every pending waiter fails with
//! `ConnectionClosed` and every later `send` fails with `ReaderDead`.
//! Reconnection is the lifecycle module's job, not this one's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::compute::frame::{read_frame, write_frame, Frame};
use crate::error::{Result, WeaveError};

/// Waiter registry shared between callers and the reader task.
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Frame>>,
    /// Set once the reader has exited; no new waiters may register.
    dead: bool,
}

impl Pending {
    fn new() -> Self {
        Self {
            waiters: HashMap::new(),
            dead: false,
        }
    }
}

/// Removes a caller's waiter entry when its `send` future is dropped
/// before the reply arrives (cancellation, timeout, write failure).
struct WaiterGuard {
    pending: Arc<Mutex<Pending>>,
    request_id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiters.remove(&self.request_id);
        }
    }
}

/// Write half of the connection as a type-erased object (a Unix socket
/// in production, a duplex pipe in tests).
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Multiplexes concurrent framed requests over one compute connection.
pub struct Multiplexer {
    writer: AsyncMutex<BoxedWriter>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Takes ownership of a connected stream and starts the reader task.
    ///
    /// `max_payload` bounds the declared length of inbound frames; a
    /// frame exceeding it is treated as a protocol violation and kills
    /// the connection.
    pub fn new<S>(stream: S, max_payload: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_half: BoxedReader = Box::new(read_half);
        let write_half: BoxedWriter = Box::new(write_half);

        let pending = Arc::new(Mutex::new(Pending::new()));
        let mux = Arc::new(Self {
            writer: AsyncMutex::new(write_half),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(reader_loop(read_half, pending, max_payload));
        if let Ok(mut slot) = mux.reader.lock() {
            *slot = Some(handle);
        }

        mux
    }

    /// Returns a fresh request id from the monotonic counter.
    ///
    /// Callers may also assign their own ids, as long as ids are unique
    /// among in-flight requests.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one framed request and awaits its correlated response.
    ///
    /// The request id is read from the frame payload. The waiter entry
    /// is registered before the write so a fast response cannot race
    /// past its caller. Dropping the returned future (caller
    /// cancellation) deregisters the waiter; a reply that arrives
    /// afterwards is dropped by the reader.
    ///
    /// # Errors
    ///
    /// - [`WeaveError::ReaderDead`] if the connection already failed.
    /// - [`WeaveError::Internal`] if the id collides with an in-flight
    ///   request.
    /// - [`WeaveError::ConnectionClosed`] if the reader exits before
    ///   the reply arrives.
    /// - [`WeaveError::ComputeTimeout`] if `deadline` elapses first.
    pub async fn send(&self, frame: Frame, deadline: Duration) -> Result<Frame> {
        let request_id = frame.request_id()?;

        let rx = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| WeaveError::Internal("pending map poisoned".to_string()))?;
            if pending.dead {
                return Err(WeaveError::ReaderDead.into());
            }
            if pending.waiters.contains_key(&request_id) {
                return Err(WeaveError::Internal(format!(
                    "request id {} already in flight",
                    request_id
                ))
                .into());
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.insert(request_id, tx);
            rx
        };

        // From here on, any exit path (including future drop) must
        // deregister the waiter.
        let _guard = WaiterGuard {
            pending: Arc::clone(&self.pending),
            request_id,
        };

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await?;
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_closed)) => Err(WeaveError::ConnectionClosed.into()),
            Err(_elapsed) => Err(WeaveError::ComputeTimeout(deadline).into()),
        }
    }

    /// True once the reader task has exited.
    pub fn is_dead(&self) -> bool {
        self.pending.lock().map(|p| p.dead).unwrap_or(true)
    }

    /// Aborts the reader and fails all pending waiters.
    ///
    /// Called during compute teardown; subsequent `send` calls return
    /// `ReaderDead`.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.reader.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.dead = true;
            pending.waiters.clear();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reader task: sole reader of the connection for its whole life.
async fn reader_loop(mut read_half: BoxedReader, pending: Arc<Mutex<Pending>>, max_payload: u32) {
    loop {
        let frame = match read_frame(&mut read_half, max_payload).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!("compute reader exiting: {}", e);
                break;
            }
        };

        let request_id = match frame.request_id() {
            Ok(id) => id,
            Err(e) => {
                // A payload too short for an id is a protocol violation;
                // the stream can no longer be trusted.
                tracing::error!("malformed compute frame, closing connection: {}", e);
                break;
            }
        };

        let waiter = match pending.lock() {
            Ok(mut pending) => pending.waiters.remove(&request_id),
            Err(_) => break,
        };

        match waiter {
            Some(tx) => {
                // oneshot send never blocks; a dropped receiver just
                // discards the reply.
                let _ = tx.send(frame);
            }
            None => {
                tracing::warn!(
                    request_id,
                    "dropping compute response with no waiter (cancelled caller or protocol violation)"
                );
            }
        }
    }

    // Reader is gone: fail everything still waiting and refuse new work.
    if let Ok(mut pending) = pending.lock() {
        pending.dead = true;
        pending.waiters.clear();
    }
}
