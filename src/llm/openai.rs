//! OpenAI-compatible provider implementation for Weave
//!
//! Connects to any `/chat/completions` endpoint that speaks the OpenAI
//! streaming dialect (OpenAI itself, llama.cpp server, vLLM, LM
//! Studio). Responses arrive as SSE `data:` lines, each carrying a
//! delta chunk, terminated by the `[DONE]` sentinel.

use crate::config::OpenAiConfig;
use crate::error::{Result, WeaveError};
use crate::llm::provider::{ChatMessage, ChatProvider, TokenCallback};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenAI-compatible API provider
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
    api_key: Option<String>,
}

/// Request structure for the chat completions API
#[derive(Debug, Serialize)]
struct CompletionsRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
}

/// Message structure for the chat completions API
#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

/// One streamed chunk
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse an SSE line into its data payload
///
/// Returns `Some` for `data:` lines (with `[DONE]` passed through as a
/// sentinel) and `None` for everything else (`event:`, `id:`,
/// comments, blanks).
fn parse_sse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(data) = line.strip_prefix("data: ") {
        if data.trim() == "[DONE]" {
            return Some("[DONE]".to_string());
        }
        return Some(data.to_string());
    }
    None
}

impl OpenAiProvider {
    /// Create a new provider instance
    ///
    /// The API key is read from the environment variable named by the
    /// config (`WEAVE_OPENAI_API_KEY` by default); servers that need no
    /// key (local llama.cpp, vLLM) work with it unset.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("weave/0.3.0")
            .build()
            .map_err(|e| WeaveError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());

        tracing::info!(
            "Initialized OpenAI-compatible provider: base_url={}, model={}, key={}",
            config.base_url,
            config.model,
            if api_key.is_some() { "set" } else { "unset" }
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Get the configured base URL
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Get the configured model name
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn convert_messages(&self, messages: &[ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_token: TokenCallback<'_>,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let request = CompletionsRequest {
            model: self.config.model.clone(),
            messages: self.convert_messages(messages),
            stream: true,
        };

        tracing::debug!(
            "Sending completions request: {} messages, model={}",
            request.messages.len(),
            request.model
        );

        let mut builder = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!("completions request failed: {}", e);
            WeaveError::Provider(format!("completions request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("provider returned error {}: {}", status, error_text);
            return Err(WeaveError::Provider(format!(
                "provider returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_text = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk
                .map_err(|e| WeaveError::Provider(format!("stream read failed: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].to_string();
                buffer.drain(..=newline);

                let Some(data) = parse_sse_line(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    tracing::debug!("completions stream done: {} chars", full_text.len());
                    return Ok(full_text);
                }

                let parsed: StreamChunk = serde_json::from_str(&data)
                    .map_err(|e| WeaveError::Provider(format!("invalid stream chunk: {}", e)))?;
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            on_token(&content)?;
                            full_text.push_str(&content);
                        }
                    }
                    if choice.finish_reason.is_some() {
                        return Ok(full_text);
                    }
                }
            }
        }

        Ok(full_text)
    }
}
