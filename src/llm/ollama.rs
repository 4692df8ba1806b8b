//! Ollama provider implementation for Weave
//!
//! Connects to a local or remote Ollama server and streams chat
//! completions. Ollama streams newline-delimited JSON: one object per
//! line, each carrying a `message.content` delta, with `done: true` on
//! the final object. Every delta is forwarded through the caller's
//! token callback as it arrives.

use crate::config::OllamaConfig;
use crate::error::{Result, WeaveError};
use crate::llm::provider::{ChatMessage, ChatProvider, TokenCallback};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ollama API provider
///
/// # Examples
///
/// ```no_run
/// use weave::config::OllamaConfig;
/// use weave::llm::{ChatMessage, ChatProvider, OllamaProvider};
///
/// # async fn example() -> weave::error::Result<()> {
/// let config = OllamaConfig {
///     host: "http://localhost:11434".to_string(),
///     model: "qwen2.5".to_string(),
/// };
/// let provider = OllamaProvider::new(config)?;
/// let messages = vec![ChatMessage::user("Hello!")];
/// let text = provider.stream_chat(&messages, &|_token| Ok(())).await?;
/// # Ok(())
/// # }
/// ```
pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
}

/// Request structure for the Ollama chat API
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

/// Message structure for the Ollama chat API
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// One NDJSON line of a streaming response
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
}

impl OllamaProvider {
    /// Create a new Ollama provider instance
    ///
    /// The HTTP client uses a connect timeout only; chat streams run as
    /// long as the model keeps producing tokens.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("weave/0.3.0")
            .build()
            .map_err(|e| WeaveError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            "Initialized Ollama provider: host={}, model={}",
            config.host,
            config.model
        );

        Ok(Self { client, config })
    }

    /// Get the configured Ollama host
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Get the configured model name
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn convert_messages(&self, messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_token: TokenCallback<'_>,
    ) -> Result<String> {
        let url = format!("{}/api/chat", self.config.host);

        let request = OllamaRequest {
            model: self.config.model.clone(),
            messages: self.convert_messages(messages),
            stream: true,
        };

        tracing::debug!(
            "Sending Ollama request: {} messages, model={}",
            request.messages.len(),
            request.model
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Ollama request failed: {}", e);
                WeaveError::Provider(format!("Ollama request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Ollama returned error {}: {}", status, error_text);
            return Err(WeaveError::Provider(format!(
                "Ollama returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full_text = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| {
                WeaveError::Provider(format!("Ollama stream read failed: {}", e))
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Drain every complete line in the buffer; a partial line
            // stays for the next chunk.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }

                let parsed: OllamaStreamChunk = serde_json::from_str(&line).map_err(|e| {
                    WeaveError::Provider(format!("Invalid Ollama stream chunk: {}", e))
                })?;

                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        on_token(&message.content)?;
                        full_text.push_str(&message.content);
                    }
                }
                if parsed.done {
                    tracing::debug!("Ollama stream complete: {} chars", full_text.len());
                    return Ok(full_text);
                }
            }
        }

        // Stream ended without a done marker; treat what arrived as the
        // full response.
        tracing::debug!("Ollama stream ended without done flag");
        Ok(full_text)
    }
}
