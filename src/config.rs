//! Configuration management for Weave
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from a YAML file, environment variables, and CLI
//! overrides.

use crate::cli::Cli;
use crate::error::{Result, WeaveError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for Weave
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server and generation defaults
    #[serde(default)]
    pub server: ServerConfig,
    /// Language-model provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Compute worker settings
    #[serde(default)]
    pub compute: ComputeSection,
    /// Caps and rate limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    #[serde(default = "default_bind")]
    pub bind: String,

    /// System prompt placed at the head of every LLM context
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Default diffusion steps when the session has none
    #[serde(default = "default_steps")]
    pub default_steps: u32,

    /// Default guidance scale when the session has none
    #[serde(default = "default_cfg")]
    pub default_cfg: f32,

    /// Generated image width in pixels
    #[serde(default = "default_image_dim")]
    pub image_width: u32,

    /// Generated image height in pixels
    #[serde(default = "default_image_dim")]
    pub image_height: u32,
}

fn default_bind() -> String {
    "127.0.0.1:8537".to_string()
}

fn default_system_prompt() -> String {
    "You are an assistant inside an image-generation app. Chat with the user \
     about the image they want, refine a generation prompt for them, and end \
     every reply with a line containing exactly ---, then a JSON object with \
     keys \"prompt\", \"generate_image\", \"steps\", \"cfg\", \"seed\"."
        .to_string()
}

fn default_steps() -> u32 {
    4
}

fn default_cfg() -> f32 {
    1.0
}

fn default_image_dim() -> u32 {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            system_prompt: default_system_prompt(),
            default_steps: default_steps(),
            default_cfg: default_cfg(),
            image_width: default_image_dim(),
            image_height: default_image_dim(),
        }
    }
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Type of provider to use ("ollama" or "openai")
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,

    /// Ollama configuration
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible configuration
    #[serde(default)]
    pub openai: OpenAiConfig,
}

fn default_provider_type() -> String {
    "ollama".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama server host
    #[serde(default = "default_ollama_host")]
    pub host: String,

    /// Model to use
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: default_ollama_host(),
            model: default_ollama_model(),
        }
    }
}

/// OpenAI-compatible provider configuration
///
/// Works against OpenAI itself or any server speaking the same
/// streaming dialect (llama.cpp server, vLLM, LM Studio).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Base URL up to (not including) `/chat/completions`
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model to use
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key; may be unset for
    /// local servers that need no key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_key_env() -> String {
    "WEAVE_OPENAI_API_KEY".to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

/// Compute worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSection {
    /// Path to the worker executable
    #[serde(default = "default_worker_path")]
    pub worker_path: PathBuf,

    /// Skip spawning the worker entirely (chat-only mode)
    #[serde(default)]
    pub disabled: bool,

    /// Seconds to wait for the worker to connect after spawn
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,

    /// Seconds to wait for the worker to exit before SIGKILL
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Deadline in seconds for a single generate request
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
}

fn default_worker_path() -> PathBuf {
    PathBuf::from("sd35-worker")
}

fn default_accept_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_generate_timeout() -> u64 {
    120
}

impl Default for ComputeSection {
    fn default() -> Self {
        Self {
            worker_path: default_worker_path(),
            disabled: false,
            accept_timeout_secs: default_accept_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            generate_timeout_secs: default_generate_timeout(),
        }
    }
}

/// Caps and rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum live sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Hours of inactivity before a session is swept
    #[serde(default = "default_session_idle_hours")]
    pub session_idle_hours: u64,

    /// Maximum concurrent SSE connections
    #[serde(default = "default_max_sse_connections")]
    pub max_sse_connections: usize,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum chat message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Maximum prompt size in bytes at the HTTP layer
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,

    /// Chat requests allowed per session per minute
    #[serde(default = "default_chat_per_minute")]
    pub chat_per_minute: u32,

    /// Generate requests allowed per session per minute
    #[serde(default = "default_generate_per_minute")]
    pub generate_per_minute: u32,

    /// Byte cap for the in-memory image store
    #[serde(default = "default_image_store_bytes")]
    pub image_store_bytes: usize,
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_idle_hours() -> u64 {
    24
}

fn default_max_sse_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_message_bytes() -> usize {
    10 * 1024
}

fn default_max_prompt_bytes() -> usize {
    50 * 1024
}

fn default_chat_per_minute() -> u32 {
    10
}

fn default_generate_per_minute() -> u32 {
    5
}

fn default_image_store_bytes() -> usize {
    256 * 1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_idle_hours: default_session_idle_hours(),
            max_sse_connections: default_max_sse_connections(),
            max_body_bytes: default_max_body_bytes(),
            max_message_bytes: default_max_message_bytes(),
            max_prompt_bytes: default_max_prompt_bytes(),
            chat_per_minute: default_chat_per_minute(),
            generate_per_minute: default_generate_per_minute(),
            image_store_bytes: default_image_store_bytes(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults
    /// when the file does not exist, then applies CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: &str, cli: &Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| WeaveError::Config(format!("cannot read {}: {}", path, e)))?;
            serde_yaml::from_str(&contents)
                .map_err(|e| WeaveError::Config(format!("cannot parse {}: {}", path, e)))?
        } else {
            tracing::debug!("config file {} not found, using defaults", path);
            Config::default()
        };

        if let Some(bind) = &cli.bind {
            config.server.bind = bind.clone();
        }
        if let Some(worker) = &cli.worker {
            config.compute.worker_path = worker.clone();
        }
        if cli.no_worker {
            config.compute.disabled = true;
        }
        if let Some(host) = &cli.ollama_host {
            config.provider.ollama.host = host.clone();
        }
        if let Some(model) = &cli.model {
            match config.provider.provider_type.as_str() {
                "openai" => config.provider.openai.model = model.clone(),
                _ => config.provider.ollama.model = model.clone(),
            }
        }

        Ok(config)
    }

    /// Validates the configuration, rejecting values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Config`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<()> {
        if self.server.bind.is_empty() {
            return Err(WeaveError::Config("server.bind must not be empty".to_string()).into());
        }
        match self.provider.provider_type.as_str() {
            "ollama" => {
                if self.provider.ollama.host.is_empty() {
                    return Err(WeaveError::Config(
                        "provider.ollama.host must not be empty".to_string(),
                    )
                    .into());
                }
                if self.provider.ollama.model.is_empty() {
                    return Err(WeaveError::Config(
                        "provider.ollama.model must not be empty".to_string(),
                    )
                    .into());
                }
            }
            "openai" => {
                if self.provider.openai.base_url.is_empty() {
                    return Err(WeaveError::Config(
                        "provider.openai.base_url must not be empty".to_string(),
                    )
                    .into());
                }
                if self.provider.openai.model.is_empty() {
                    return Err(WeaveError::Config(
                        "provider.openai.model must not be empty".to_string(),
                    )
                    .into());
                }
            }
            other => {
                return Err(WeaveError::Config(format!(
                    "unknown provider type: {}",
                    other
                ))
                .into());
            }
        }
        if self.limits.max_sessions == 0 {
            return Err(
                WeaveError::Config("limits.max_sessions must be greater than 0".to_string()).into(),
            );
        }
        if self.limits.max_sse_connections == 0 {
            return Err(WeaveError::Config(
                "limits.max_sse_connections must be greater than 0".to_string(),
            )
            .into());
        }
        if self.server.image_width == 0 || self.server.image_height == 0 {
            return Err(
                WeaveError::Config("image dimensions must be greater than 0".to_string()).into(),
            );
        }
        if self.server.default_steps == 0 || self.server.default_steps > 100 {
            return Err(WeaveError::Config(
                "server.default_steps must be within [1, 100]".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
