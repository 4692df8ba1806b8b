//! Session-scoped Server-Sent Events broker
//!
//! The broker maps session ids to live SSE connections and enforces at
//! most one connection per session: registering a new connection for a
//! session cancels the previous one's done-token so its serve stream
//! ends with no further events delivered.
//!
//! Cleanup is by identity, not by key. Each connection carries a unique
//! numeric id, and the guard that runs when a serve stream is dropped
//! only removes the registry entry if it still points at *that*
//! connection. Without the check, a replacement registered before the
//! old stream's guard runs would be clobbered by the old guard.
//!
//! Each connection owns a bounded event channel. `try_send` failure is
//! the backpressure signal: a full queue (slow client) or a dropped
//! receiver (disconnected client) surfaces as an error to the producer,
//! which aborts its in-flight work instead of buffering unboundedly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WeaveError};

/// Queue depth per connection before a client counts as "too slow".
const CONNECTION_QUEUE_DEPTH: usize = 256;

/// One event on the wire: `event: <type>\ndata: <json>\n\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event type name
    pub event: String,
    /// JSON payload
    pub data: serde_json::Value,
}

impl SseEvent {
    /// Creates an event with the given type and payload.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Renders the event in SSE wire format.
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }

    /// `connected` -- first event on every new stream.
    pub fn connected(session_id: &str) -> Self {
        Self::new("connected", json!({ "session": session_id }))
    }

    /// `agent-token` -- one streamed model token.
    pub fn agent_token(token: &str) -> Self {
        Self::new("agent-token", json!({ "token": token }))
    }

    /// `agent-done` -- the assistant bubble is complete.
    pub fn agent_done() -> Self {
        Self::new("agent-done", json!({ "status": "done" }))
    }

    /// `agent-retry` -- a format failure; the client discards the
    /// partial bubble.
    pub fn agent_retry(attempt: usize, reason: &str) -> Self {
        Self::new("agent-retry", json!({ "attempt": attempt, "reason": reason }))
    }

    /// `prompt-update` -- the active prompt changed.
    pub fn prompt_update(prompt: &str) -> Self {
        Self::new("prompt-update", json!({ "prompt": prompt }))
    }

    /// `settings-update` -- accepted settings, with an optional note
    /// when clamping adjusted them.
    pub fn settings_update(steps: u32, cfg: f32, seed: i64, note: Option<&str>) -> Self {
        let mut data = json!({ "steps": steps, "cfg": cfg, "seed": seed });
        if let Some(note) = note {
            data["note"] = json!(note);
        }
        Self::new("settings-update", data)
    }

    /// `generation-started` -- a compute request is in flight.
    pub fn generation_started(prompt: &str) -> Self {
        Self::new("generation-started", json!({ "prompt": prompt }))
    }

    /// `image-ready` -- a generated image is available.
    pub fn image_ready(url: &str, width: u32, height: u32) -> Self {
        Self::new(
            "image-ready",
            json!({ "url": url, "width": width, "height": height }),
        )
    }

    /// `error` -- a user-visible failure.
    pub fn error(message: &str) -> Self {
        Self::new("error", json!({ "message": message }))
    }
}

/// Registry entry for one live connection.
struct Connection {
    /// Identity for the guard's replacement check
    id: u64,
    sender: mpsc::Sender<SseEvent>,
    done: CancellationToken,
}

/// Removes the registry entry when the serve stream is dropped, but
/// only while the entry still belongs to this connection.
pub struct ConnectionGuard {
    broker: Arc<SseBroker>,
    session_id: String,
    connection_id: u64,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Ok(mut connections) = self.broker.connections.lock() {
            let matches = connections
                .get(&self.session_id)
                .map(|c| c.id == self.connection_id)
                .unwrap_or(false);
            if matches {
                connections.remove(&self.session_id);
                tracing::debug!(session = %self.session_id, "sse connection closed");
            }
        }
    }
}

/// A registered connection handed to the serve handler.
#[derive(Debug)]
pub struct Registration {
    /// Stream of queued events for this connection
    pub events: ReceiverStream<SseEvent>,
    /// Fires when a replacement connection takes over
    pub done: CancellationToken,
    /// Cleanup guard; keep it alive as long as the stream
    pub guard: ConnectionGuard,
}

/// Session-id -> connection registry with fan-out send operations.
pub struct SseBroker {
    connections: Mutex<HashMap<String, Connection>>,
    next_connection_id: AtomicU64,
    max_connections: usize,
}

impl SseBroker {
    /// Creates a broker capped at `max_connections` live streams.
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            max_connections,
        })
    }

    /// Registers a connection for `session_id`, replacing any previous
    /// one, and queues the initial `connected` event.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Sse`] when the global connection cap is
    /// reached (and the session has no existing connection to replace).
    pub fn register(self: &Arc<Self>, session_id: &str) -> Result<Registration> {
        let (sender, receiver) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let done = CancellationToken::new();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| WeaveError::Internal("sse registry poisoned".to_string()))?;

            let replacing = connections.contains_key(session_id);
            if !replacing && connections.len() >= self.max_connections {
                return Err(WeaveError::Sse("connection limit reached".to_string()).into());
            }

            let connection = Connection {
                id: connection_id,
                sender: sender.clone(),
                done: done.clone(),
            };
            if let Some(previous) = connections.insert(session_id.to_string(), connection) {
                // The old serve stream ends here; its guard will see a
                // different connection id and leave our entry alone.
                previous.done.cancel();
                tracing::debug!(session = %session_id, "replaced sse connection");
            }
        }

        // Queue depth is fresh, so this cannot fail.
        let _ = sender.try_send(SseEvent::connected(session_id));

        Ok(Registration {
            events: ReceiverStream::new(receiver),
            done: done.clone(),
            guard: ConnectionGuard {
                broker: Arc::clone(self),
                session_id: session_id.to_string(),
                connection_id,
            },
        })
    }

    /// Sends an event to the session's live connection, if any.
    ///
    /// Having no connection is not an error (events are fire-and-forget
    /// for detached sessions). A failed write is: it means the client
    /// is gone or too slow, and the producer should stop.
    pub fn send_to_session(&self, session_id: &str, event: SseEvent) -> Result<()> {
        let sender = {
            let connections = self
                .connections
                .lock()
                .map_err(|_| WeaveError::Internal("sse registry poisoned".to_string()))?;
            match connections.get(session_id) {
                Some(connection) => connection.sender.clone(),
                None => return Ok(()),
            }
        };

        sender.try_send(event).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "client too slow",
                mpsc::error::TrySendError::Closed(_) => "client disconnected",
            };
            anyhow::Error::from(WeaveError::Sse(format!(
                "send to session {} failed: {}",
                session_id, reason
            )))
        })
    }

    /// Sends an event to every live connection; per-connection failures
    /// are logged and skipped.
    pub fn broadcast(&self, event: SseEvent) {
        let senders: Vec<(String, mpsc::Sender<SseEvent>)> = match self.connections.lock() {
            Ok(connections) => connections
                .iter()
                .map(|(id, c)| (id.clone(), c.sender.clone()))
                .collect(),
            Err(_) => return,
        };
        for (session_id, sender) in senders {
            if sender.try_send(event.clone()).is_err() {
                tracing::debug!(session = %session_id, "broadcast skipped stalled connection");
            }
        }
    }

    /// Ends the session's connection, if any.
    pub fn close_session(&self, session_id: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            if let Some(connection) = connections.remove(session_id) {
                connection.done.cancel();
            }
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Ends every connection and empties the registry.
    pub fn shutdown(&self) {
        if let Ok(mut connections) = self.connections.lock() {
            for (_, connection) in connections.drain() {
                connection.done.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn test_event_wire_format() {
        let event = SseEvent::connected("abc");
        assert_eq!(
            event.to_wire(),
            "event: connected\ndata: {\"session\":\"abc\"}\n\n"
        );
    }

    #[test]
    fn test_event_payload_schemas() {
        assert_eq!(
            SseEvent::prompt_update("a cat").data,
            json!({"prompt": "a cat"})
        );
        assert_eq!(
            SseEvent::image_ready("/images/x.png", 64, 64).data,
            json!({"url": "/images/x.png", "width": 64, "height": 64})
        );
        let plain = SseEvent::settings_update(20, 7.5, -1, None);
        assert!(plain.data.get("note").is_none());
        let noted = SseEvent::settings_update(100, 7.5, -1, Some("steps capped at 100"));
        assert_eq!(noted.data["note"], json!("steps capped at 100"));
    }

    #[tokio::test]
    async fn test_register_queues_connected_event() {
        let broker = SseBroker::new(10);
        let mut registration = broker.register("session-1").unwrap();

        let first = registration.events.next().await.unwrap();
        assert_eq!(first.event, "connected");
        assert_eq!(first.data, json!({"session": "session-1"}));
        assert_eq!(broker.count(), 1);
    }

    #[tokio::test]
    async fn test_send_reaches_registered_connection() {
        let broker = SseBroker::new(10);
        let mut registration = broker.register("s").unwrap();
        let _connected = registration.events.next().await.unwrap();

        broker
            .send_to_session("s", SseEvent::agent_token("hi"))
            .unwrap();
        let event = registration.events.next().await.unwrap();
        assert_eq!(event.event, "agent-token");
        assert_eq!(event.data, json!({"token": "hi"}));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_ok() {
        let broker = SseBroker::new(10);
        broker
            .send_to_session("nobody-home", SseEvent::agent_done())
            .unwrap();
    }

    #[tokio::test]
    async fn test_replacement_cancels_old_and_routes_to_new() {
        let broker = SseBroker::new(10);
        let mut first = broker.register("s").unwrap();
        let _ = first.events.next().await.unwrap();

        let mut second = broker.register("s").unwrap();
        assert!(
            first.done.is_cancelled(),
            "old connection's done-token fires on replacement"
        );
        assert_eq!(broker.count(), 1);

        let _ = second.events.next().await.unwrap(); // connected
        broker
            .send_to_session("s", SseEvent::agent_token("new only"))
            .unwrap();
        let event = second.events.next().await.unwrap();
        assert_eq!(event.data, json!({"token": "new only"}));

        // The old stream got nothing after replacement beyond what was
        // already queued.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), first.events.next())
                .await
                .is_err()
                || first.events.next().await.is_none()
        );
    }

    #[tokio::test]
    async fn test_old_guard_does_not_clobber_replacement() {
        let broker = SseBroker::new(10);
        let first = broker.register("s").unwrap();
        let _second = broker.register("s").unwrap();

        // Old stream's cleanup runs after the replacement registered.
        drop(first);
        assert_eq!(
            broker.count(),
            1,
            "identity check keeps the new connection registered"
        );

        broker
            .send_to_session("s", SseEvent::agent_done())
            .expect("new connection must still be reachable");
    }

    #[tokio::test]
    async fn test_guard_removes_own_entry() {
        let broker = SseBroker::new(10);
        let registration = broker.register("s").unwrap();
        assert_eq!(broker.count(), 1);
        drop(registration);
        assert_eq!(broker.count(), 0);
    }

    #[tokio::test]
    async fn test_connection_cap_enforced() {
        let broker = SseBroker::new(2);
        let _a = broker.register("a").unwrap();
        let _b = broker.register("b").unwrap();

        let err = broker.register("c").unwrap_err();
        assert!(err.to_string().contains("connection limit"));

        // Replacing an existing session is allowed at the cap.
        let _a2 = broker.register("a").unwrap();
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_errors() {
        let broker = SseBroker::new(10);
        let registration = broker.register("s").unwrap();

        // Drop only the stream, keeping the guard so the registry entry
        // survives -- simulating a disconnected client whose cleanup
        // has not run yet.
        let Registration { events, guard, .. } = registration;
        drop(events);

        let err = broker
            .send_to_session("s", SseEvent::agent_token("x"))
            .unwrap_err();
        assert!(err.to_string().contains("disconnected"));
        drop(guard);
    }

    #[tokio::test]
    async fn test_slow_client_queue_overflow_errors() {
        let broker = SseBroker::new(10);
        let _registration = broker.register("s").unwrap();

        // Fill the queue without draining it (connected took one slot).
        for _ in 0..CONNECTION_QUEUE_DEPTH - 1 {
            broker
                .send_to_session("s", SseEvent::agent_token("x"))
                .unwrap();
        }
        let err = broker
            .send_to_session("s", SseEvent::agent_token("overflow"))
            .unwrap_err();
        assert!(err.to_string().contains("too slow"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let broker = SseBroker::new(10);
        let a = broker.register("a").unwrap();
        let b = broker.register("b").unwrap();

        broker.shutdown();
        assert_eq!(broker.count(), 0);
        assert!(a.done.is_cancelled());
        assert!(b.done.is_cancelled());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_sessions() {
        let broker = SseBroker::new(10);
        let mut a = broker.register("a").unwrap();
        let mut b = broker.register("b").unwrap();
        let _ = a.events.next().await;
        let _ = b.events.next().await;

        broker.broadcast(SseEvent::error("maintenance"));
        assert_eq!(a.events.next().await.unwrap().event, "error");
        assert_eq!(b.events.next().await.unwrap().event, "error");
    }
}
