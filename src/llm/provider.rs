//! Provider trait and message types for the language-model backend
//!
//! The orchestrator talks to its model through [`ChatProvider`], a
//! streaming interface: the provider invokes a token callback for every
//! chunk as it arrives and returns the full concatenated text at the
//! end. The callback returning an error is the backpressure signal --
//! the provider must abort the in-flight request rather than buffer
//! tokens nobody will read.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single message in the outbound LLM context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender (user, assistant, system)
    pub role: String,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Creates a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    /// Creates a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Per-token streaming callback.
///
/// Returning `Err` aborts the stream; the provider surfaces that as
/// [`crate::error::WeaveError::StreamAborted`].
pub type TokenCallback<'a> = &'a (dyn Fn(&str) -> Result<()> + Send + Sync);

/// Streaming chat interface every model backend must satisfy.
///
/// # Examples
///
/// ```no_run
/// use weave::llm::provider::{ChatMessage, ChatProvider, TokenCallback};
/// use weave::error::Result;
/// use async_trait::async_trait;
///
/// struct CannedProvider;
///
/// #[async_trait]
/// impl ChatProvider for CannedProvider {
///     async fn stream_chat(
///         &self,
///         _messages: &[ChatMessage],
///         on_token: TokenCallback<'_>,
///     ) -> Result<String> {
///         on_token("Hi!")?;
///         Ok("Hi!".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Streams a completion for `messages`.
    ///
    /// `on_token` is invoked once per content chunk, in model order.
    /// The return value is the full response text (the concatenation of
    /// every chunk).
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails, the response is
    /// malformed, or the callback aborted the stream.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_token: TokenCallback<'_>,
    ) -> Result<String>;
}
