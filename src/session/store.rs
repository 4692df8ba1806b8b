//! Session store: per-browser state with LRU and idle eviction
//!
//! Sessions are created on first reference and owned exclusively by the
//! store. Lookup takes a read lock and only upgrades to a write lock to
//! create; every hit refreshes the session's last-activity stamp.
//!
//! Two eviction policies run side by side: a background sweep removes
//! sessions idle past the inactivity timeout, and inserts over the cap
//! evict the session with the oldest last-activity first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio_util::sync::CancellationToken;

use crate::session::conversation::Conversation;
use crate::session::persistence::{SessionObserver, SessionPersistence};
use crate::session::settings::GenerationSettings;

/// Tuning for the session store.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Maximum live sessions before LRU eviction
    pub max_sessions: usize,
    /// Idle time after which the sweeper removes a session
    pub idle_timeout: Duration,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Mutable state of one session, guarded by the session mutex.
struct SessionInner {
    conversation: Conversation,
    settings: Option<GenerationSettings>,
    last_activity: Instant,
}

/// One browser session: conversation, settings, activity stamp.
///
/// The store hands out `Arc<Session>`; all state behind the session's
/// own mutex, so holding the store lock is never required to use one.
pub struct Session {
    id: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                conversation: Conversation::new(),
                settings: None,
                last_activity: Instant::now(),
            }),
        }
    }

    /// The 32-hex session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs `f` with the conversation under the session mutex.
    pub fn with_conversation<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        f(&mut inner.conversation)
    }

    /// Current generation settings, if any were stored.
    pub fn settings(&self) -> Option<GenerationSettings> {
        self.inner.lock().expect("session mutex poisoned").settings
    }

    /// Stores the session's generation settings.
    pub fn set_settings(&self, settings: GenerationSettings) {
        self.inner.lock().expect("session mutex poisoned").settings = Some(settings);
    }

    /// Refreshes the last-activity stamp.
    pub fn touch(&self) {
        self.inner
            .lock()
            .expect("session mutex poisoned")
            .last_activity = Instant::now();
    }

    /// When the session was last referenced.
    pub fn last_activity(&self) -> Instant {
        self.inner
            .lock()
            .expect("session mutex poisoned")
            .last_activity
    }
}

/// Generates a fresh session id: 16 random bytes as 32 lowercase hex.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(32);
    for byte in bytes {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Checks the strict session-id shape: exactly 32 lowercase hex chars.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == 32
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Map of live sessions with LRU and idle eviction.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: SessionStoreConfig,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            persistence: None,
        }
    }

    /// Creates a store whose sessions report mutations to `sink`.
    pub fn with_persistence(
        config: SessionStoreConfig,
        sink: Arc<dyn SessionPersistence>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            persistence: Some(sink),
        }
    }

    /// Looks up a session without creating it; hits are touched.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("session map poisoned");
        let session = sessions.get(id).cloned();
        drop(sessions);
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    /// Returns the session for `id`, creating it on first reference.
    ///
    /// The read-lock fast path covers the common case; creation takes
    /// the write lock and may evict the least-recently-active session
    /// to stay under the cap.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        if let Some(session) = self.get(id) {
            return session;
        }

        let mut sessions = self.sessions.write().expect("session map poisoned");
        // Another writer may have created it while we waited.
        if let Some(session) = sessions.get(id) {
            session.touch();
            return Arc::clone(session);
        }

        if sessions.len() >= self.config.max_sessions {
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_activity())
                .map(|(k, _)| k.clone())
            {
                sessions.remove(&oldest);
                tracing::info!(session = %oldest, "evicted session at capacity");
            }
        }

        let session = Arc::new(Session::new(id.to_string()));
        if let Some(sink) = &self.persistence {
            session.with_conversation(|conversation| {
                conversation.set_observer(Some(Arc::new(SessionObserver {
                    session_id: id.to_string(),
                    sink: Arc::clone(sink),
                })));
            });
        }
        sessions.insert(id.to_string(), Arc::clone(&session));
        tracing::debug!(session = %id, total = sessions.len(), "created session");
        session
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    /// Removes sessions idle longer than the configured timeout;
    /// returns how many were dropped.
    pub fn remove_idle(&self) -> usize {
        let cutoff = Instant::now()
            .checked_sub(self.config.idle_timeout)
            .unwrap_or_else(Instant::now);
        let mut sessions = self.sessions.write().expect("session map poisoned");
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_activity() > cutoff;
            if !keep {
                tracing::info!(session = %id, "removed idle session");
            }
            keep
        });
        before - sessions.len()
    }

    /// Starts the background idle sweep; exits when `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let store = Arc::clone(self);
        let interval = store.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.remove_idle();
                        if removed > 0 {
                            tracing::debug!(removed, "session sweep");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store(max: usize) -> SessionStore {
        SessionStore::new(SessionStoreConfig {
            max_sessions: max,
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_generated_ids_are_32_lowercase_hex_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(is_valid_session_id(&a));
        assert!(is_valid_session_id(&b));
    }

    #[test]
    fn test_id_validation_rejects_bad_shapes() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("short"));
        assert!(!is_valid_session_id(&"A".repeat(32)), "uppercase rejected");
        assert!(!is_valid_session_id(&"g".repeat(32)), "non-hex rejected");
        assert!(is_valid_session_id(&"0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn test_get_or_create_then_get() {
        let store = small_store(10);
        assert!(store.get("a".repeat(32).as_str()).is_none());

        let id = "a".repeat(32);
        let session = store.get_or_create(&id);
        assert_eq!(session.id(), id);
        assert_eq!(store.count(), 1);

        let again = store.get_or_create(&id);
        assert!(Arc::ptr_eq(&session, &again), "same instance returned");
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let store = small_store(3);
        let a = "a".repeat(32);
        let b = "b".repeat(32);
        let c = "c".repeat(32);
        let d = "d".repeat(32);

        store.get_or_create(&a);
        std::thread::sleep(Duration::from_millis(5));
        store.get_or_create(&b);
        std::thread::sleep(Duration::from_millis(5));
        store.get_or_create(&c);
        std::thread::sleep(Duration::from_millis(5));

        // Touch A so B becomes the oldest.
        store.get(&a);
        store.get_or_create(&d);

        assert_eq!(store.count(), 3);
        assert!(store.get(&b).is_none(), "oldest session evicted");
        assert!(store.get(&a).is_some());
        assert!(store.get(&d).is_some());
    }

    #[test]
    fn test_remove_idle_drops_only_stale_sessions() {
        let store = small_store(10);
        let stale = "e".repeat(32);
        let fresh = "f".repeat(32);

        store.get_or_create(&stale);
        std::thread::sleep(Duration::from_millis(60));
        store.get_or_create(&fresh);

        let removed = store.remove_idle();
        assert_eq!(removed, 1);
        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());
    }

    #[test]
    fn test_session_state_isolated_per_session() {
        let store = small_store(10);
        let one = store.get_or_create(&"1".repeat(32));
        let two = store.get_or_create(&"2".repeat(32));

        one.with_conversation(|c| {
            c.add_user_message("only in one");
        });
        one.set_settings(GenerationSettings {
            steps: 10,
            cfg: 2.0,
            seed: 5,
        });

        assert_eq!(one.with_conversation(|c| c.len()), 1);
        assert_eq!(two.with_conversation(|c| c.len()), 0);
        assert!(two.settings().is_none());
        assert_eq!(one.settings().unwrap().steps, 10);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_returns_one_instance() {
        let store = Arc::new(small_store(100));
        let id = "9".repeat(32);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.get_or_create(&id) }));
        }

        let sessions: Vec<Arc<Session>> =
            futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(store.count(), 1);
        for session in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], session));
        }
    }

    #[tokio::test]
    async fn test_sweeper_exits_on_cancel() {
        let store = Arc::new(small_store(10));
        let cancel = CancellationToken::new();
        store.spawn_sweeper(cancel.clone());

        store.get_or_create(&"5".repeat(32));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.count(), 0, "sweeper removed the idle session");

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
