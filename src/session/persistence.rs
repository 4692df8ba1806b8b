//! Pluggable persistence hook for conversation state
//!
//! Durable storage is out of scope for the orchestrator itself, but the
//! seam for it is not: every conversation mutation reports through a
//! single-method trait so a desktop shell can persist state however it
//! likes. The hook runs under the session mutex and must not block or
//! re-enter the session.

use std::sync::Arc;

use crate::session::conversation::{Conversation, ConversationObserver};

/// Receives conversation-change notifications for all sessions.
pub trait SessionPersistence: Send + Sync {
    /// Called after any mutation of `session_id`'s conversation, with
    /// the conversation lock still held.
    fn conversation_changed(&self, session_id: &str, conversation: &Conversation);
}

/// Default hook that persists nothing.
pub struct NoopPersistence;

impl SessionPersistence for NoopPersistence {
    fn conversation_changed(&self, _session_id: &str, _conversation: &Conversation) {}
}

/// Adapts the per-conversation observer to the store-wide persistence
/// sink by capturing the owning session's id.
pub(crate) struct SessionObserver {
    pub(crate) session_id: String,
    pub(crate) sink: Arc<dyn SessionPersistence>,
}

impl ConversationObserver for SessionObserver {
    fn conversation_changed(&self, conversation: &Conversation) {
        self.sink.conversation_changed(&self.session_id, conversation);
    }
}
