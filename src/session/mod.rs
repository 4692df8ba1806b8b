//! Per-browser session state: conversations, settings, and the store
//! that owns them.

pub mod conversation;
pub mod persistence;
pub mod settings;
pub mod store;

pub use conversation::{
    Conversation, ConversationMessage, ConversationObserver, PreviewStatus, StateSnapshot,
    MAX_HISTORY,
};
pub use persistence::{NoopPersistence, SessionPersistence};
pub use settings::{parse_and_clamp, ClampResult, GenerationSettings};
pub use store::{generate_session_id, is_valid_session_id, Session, SessionStore, SessionStoreConfig};
