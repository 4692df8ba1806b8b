//! Per-session rate limiting for chat and generate requests
//!
//! Fixed one-minute windows per session id. Entries idle for half an
//! hour are dropped by a background sweep so abandoned sessions don't
//! accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::WeaveError;

/// How long a limiter entry may sit unused before the sweep drops it.
const IDLE_EXPIRY: Duration = Duration::from_secs(30 * 60);

struct Entry {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

/// Fixed-window counter keyed by session id.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    message: String,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` requests per minute, with
    /// `message` as the user-visible refusal text.
    pub fn per_minute(limit: u32, message: impl Into<String>) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
            message: message.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request for `key`, refusing it over the limit.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::RateLimitExceeded`] when the window is
    /// full; the request is not counted in that case.
    pub fn check(&self, key: &str) -> Result<(), WeaveError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            window_start: now,
            count: 0,
            last_seen: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.last_seen = now;

        if entry.count >= self.limit {
            return Err(WeaveError::RateLimitExceeded {
                limit: self.limit,
                message: self.message.clone(),
            });
        }
        entry.count += 1;
        Ok(())
    }

    /// Removes entries unused for [`IDLE_EXPIRY`]; returns the count.
    pub fn sweep(&self) -> usize {
        let cutoff = Instant::now().checked_sub(IDLE_EXPIRY);
        let Some(cutoff) = cutoff else { return 0 };
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.last_seen > cutoff);
        before - entries.len()
    }

    /// Number of tracked sessions.
    pub fn tracked(&self) -> usize {
        self.entries.lock().expect("rate limiter poisoned").len()
    }

    /// Starts a background sweep on `interval`; exits when `cancel`
    /// fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "rate limiter sweep");
                        }
                    }
                }
            }
        });
    }
}
