//! Shared helpers for integration tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use weave::config::Config;
use weave::error::Result;
use weave::llm::{ChatMessage, ChatProvider, TokenCallback};
use weave::server::AppState;

/// A provider that pops one canned response per call.
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    pub contexts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            contexts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_token: TokenCallback<'_>,
    ) -> Result<String> {
        self.contexts.lock().unwrap().push(messages.to_vec());
        let text = self.responses.lock().unwrap().remove(0);
        on_token(&text)?;
        Ok(text)
    }
}

/// A well-formed response with no generation request.
pub const PLAIN_RESPONSE: &str =
    "Hi!\n---\n{\"prompt\":\"\",\"generate_image\":false,\"steps\":4,\"cfg\":1.0,\"seed\":-1}";

/// A well-formed response asking to generate "a cat".
pub const GENERATE_RESPONSE_TEXT: &str =
    "Painting a cat now.\n---\n{\"prompt\":\"a cat\",\"generate_image\":true,\"steps\":4,\"cfg\":1.0,\"seed\":-1}";

/// Builds app state around a scripted provider with test-friendly
/// limits.
pub fn test_state(provider: Arc<ScriptedProvider>) -> AppState {
    let mut config = Config::default();
    config.compute.disabled = true;
    config.limits.chat_per_minute = 100;
    config.limits.generate_per_minute = 100;
    AppState::new(config, provider)
}

/// A valid session id for cookie headers.
pub fn session_id(fill: char) -> String {
    std::iter::repeat(fill).take(32).collect()
}
