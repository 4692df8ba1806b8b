//! Conversation management for a single browser session
//!
//! A [`Conversation`] holds the ordered message history (capped at
//! [`MAX_HISTORY`], oldest dropped first), the current and previous
//! prompt strings, and a prompt-edited flag. Message ids are unique and
//! strictly increasing within a conversation and restart at 1 after
//! [`Conversation::clear`].
//!
//! Assistant messages whose metadata introduces a new prompt get a
//! [`StateSnapshot`] attached, capturing the generation parameters at
//! that point so the UI can restore them later.
//!
//! The conversation itself is not internally locked; its owning
//! [`crate::session::Session`] guards it with the session mutex, and
//! every mutation runs under that lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::metadata::LlmMetadata;
use crate::llm::provider::ChatMessage;

/// Maximum number of messages retained in history.
pub const MAX_HISTORY: usize = 100;

/// Preview lifecycle of a snapshot's generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    /// No generation has been started for this snapshot
    None,
    /// Generation is in flight
    Generating,
    /// An image is available at the preview URL
    Complete,
}

/// Point-in-time record of generation parameters, attached to an
/// assistant message when its metadata changes the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Prompt the snapshot captures
    pub prompt: String,
    /// Diffusion steps at capture time
    pub steps: u32,
    /// Guidance scale at capture time
    pub cfg: f32,
    /// Seed at capture time (-1 = random)
    pub seed: i64,
    /// Where the preview image is in its lifecycle
    pub preview_status: PreviewStatus,
    /// URL of the preview image, empty until one exists
    pub preview_url: String,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function/tool to call
    pub name: String,
    /// Arguments for the function (as JSON string)
    pub arguments: String,
}

/// A tool invocation recorded on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Function call details
    pub function: FunctionCall,
}

/// One message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Id unique within the conversation, strictly increasing
    pub id: u64,
    /// Role of the sender: "user", "assistant", or "system"
    pub role: String,
    /// Message text
    pub content: String,
    /// Optional tool calls carried by the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Optional generation snapshot (assistant messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<StateSnapshot>,
}

/// Observer invoked after every conversation mutation.
///
/// A single-method seam for external persistence; the callback runs
/// under the session mutex, so implementations must not re-enter the
/// session.
pub trait ConversationObserver: Send + Sync {
    /// Called after any mutation, with the conversation still locked.
    fn conversation_changed(&self, conversation: &Conversation);
}

/// Ordered message history plus prompt state for one session.
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    next_id: u64,
    current_prompt: String,
    previous_prompt: String,
    prompt_edited: bool,
    observer: Option<Arc<dyn ConversationObserver>>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("messages", &self.messages.len())
            .field("next_id", &self.next_id)
            .field("current_prompt", &self.current_prompt)
            .field("prompt_edited", &self.prompt_edited)
            .finish()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Creates an empty conversation with ids starting at 1.
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_id: 1,
            current_prompt: String::new(),
            previous_prompt: String::new(),
            prompt_edited: false,
            observer: None,
        }
    }

    /// Installs (or clears) the mutation observer.
    pub fn set_observer(&mut self, observer: Option<Arc<dyn ConversationObserver>>) {
        self.observer = observer;
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer.conversation_changed(self);
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Drops oldest messages until the history fits the cap.
    fn trim(&mut self) {
        if self.messages.len() > MAX_HISTORY {
            let excess = self.messages.len() - MAX_HISTORY;
            self.messages.drain(..excess);
        }
    }

    /// Appends a user message and returns its id.
    pub fn add_user_message(&mut self, content: impl Into<String>) -> u64 {
        let id = self.allocate_id();
        self.messages.push(ConversationMessage {
            id,
            role: "user".to_string(),
            content: content.into(),
            tool_calls: None,
            snapshot: None,
        });
        self.trim();
        self.notify();
        id
    }

    /// Appends an assistant message and returns its id.
    ///
    /// If `metadata` is present with a non-empty prompt that differs
    /// from the most recent prior snapshot's prompt, a fresh snapshot
    /// is attached (preview status `None`, empty URL). If `prompt` is
    /// non-empty the conversation's prompt state rotates: previous
    /// takes the old current, current takes `prompt`.
    pub fn add_assistant_message(
        &mut self,
        content: impl Into<String>,
        prompt: &str,
        metadata: Option<&LlmMetadata>,
    ) -> u64 {
        let snapshot = metadata.and_then(|meta| {
            if meta.prompt.is_empty() || self.last_snapshot_prompt() == Some(meta.prompt.as_str()) {
                return None;
            }
            Some(StateSnapshot {
                prompt: meta.prompt.clone(),
                steps: meta.steps.max(0) as u32,
                cfg: meta.cfg as f32,
                seed: meta.seed,
                preview_status: PreviewStatus::None,
                preview_url: String::new(),
                created_at: Utc::now(),
            })
        });

        if !prompt.is_empty() {
            self.previous_prompt = std::mem::replace(&mut self.current_prompt, prompt.to_string());
        }

        let id = self.allocate_id();
        self.messages.push(ConversationMessage {
            id,
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls: None,
            snapshot,
        });
        self.trim();
        self.notify();
        id
    }

    /// Prompt of the most recent message carrying a snapshot.
    fn last_snapshot_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.snapshot.as_ref().map(|s| s.prompt.as_str()))
    }

    /// Replaces the current prompt if `new_prompt` differs, marking the
    /// conversation as user-edited.
    pub fn update_prompt(&mut self, new_prompt: &str) {
        if new_prompt == self.current_prompt {
            return;
        }
        self.previous_prompt = std::mem::replace(&mut self.current_prompt, new_prompt.to_string());
        self.prompt_edited = true;
        self.notify();
    }

    /// Injects a user-visible record of a prompt edit, at most once per
    /// edit.
    ///
    /// The record is a user-role message because the model provider
    /// permits at most one leading system message.
    pub fn notify_prompt_edited(&mut self) {
        if !self.prompt_edited {
            return;
        }
        self.prompt_edited = false;
        let content = format!("[user edited prompt to: \"{}\"]", self.current_prompt);
        let id = self.allocate_id();
        self.messages.push(ConversationMessage {
            id,
            role: "user".to_string(),
            content,
            tool_calls: None,
            snapshot: None,
        });
        self.trim();
        self.notify();
    }

    /// Empties the history and prompt state; ids restart at 1.
    ///
    /// The message buffer's capacity is retained for reuse.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.current_prompt.clear();
        self.previous_prompt.clear();
        self.prompt_edited = false;
        self.next_id = 1;
        self.notify();
    }

    /// Assembles the outbound LLM context without mutating history.
    ///
    /// Order: optional system message, optional settings message (when
    /// any of steps/cfg/seed is non-zero), all stored messages, and a
    /// trailing user message restating the current prompt so the model
    /// always sees prompt state no matter how long ago it was set.
    pub fn build_llm_context(
        &self,
        system_prompt: &str,
        steps: u32,
        cfg: f32,
        seed: i64,
    ) -> Vec<ChatMessage> {
        let mut context = Vec::with_capacity(self.messages.len() + 3);

        if !system_prompt.is_empty() {
            context.push(ChatMessage::system(system_prompt));
        }

        if steps != 0 || cfg != 0.0 || seed != 0 {
            context.push(ChatMessage::user(format!(
                "[Current generation settings: steps={}, cfg={:.1}, seed={}]",
                steps, cfg, seed
            )));
        }

        for message in &self.messages {
            context.push(ChatMessage {
                role: message.role.clone(),
                content: message.content.clone(),
            });
        }

        if !self.current_prompt.is_empty() {
            context.push(ChatMessage::user(format!(
                "[current prompt: \"{}\"]",
                self.current_prompt
            )));
        }

        context
    }

    /// Updates the preview fields on the snapshot of message `id`.
    ///
    /// A message without a snapshot (or an unknown id) is left alone.
    pub fn update_message_preview(&mut self, id: u64, status: PreviewStatus, url: &str) {
        let mut changed = false;
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            if let Some(snapshot) = message.snapshot.as_mut() {
                snapshot.preview_status = status;
                snapshot.preview_url = url.to_string();
                changed = true;
            }
        }
        if changed {
            self.notify();
        }
    }

    /// All messages in order.
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Number of messages in history.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The active prompt string (may be empty).
    pub fn current_prompt(&self) -> &str {
        &self.current_prompt
    }

    /// The prompt before the last change (may be empty).
    pub fn previous_prompt(&self) -> &str {
        &self.previous_prompt
    }

    /// True when a user edit has not yet been surfaced to the model.
    pub fn prompt_edited(&self) -> bool {
        self.prompt_edited
    }
}
