//! Error types for Weave
//!
//! This module defines all error types used throughout the orchestrator,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Weave operations
///
/// This enum encompasses all possible errors that can occur while
/// orchestrating chat turns, talking to the compute worker, streaming
/// events to browsers, and validating user input.
#[derive(Error, Debug)]
pub enum WeaveError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Language-model provider errors (API calls, malformed responses)
    #[error("Provider error: {0}")]
    Provider(String),

    /// The streaming token callback asked the provider to stop
    ///
    /// Raised when the SSE consumer is gone and the chat handler wants
    /// the in-flight model call aborted rather than buffered.
    #[error("Stream aborted by consumer: {0}")]
    StreamAborted(String),

    /// `XDG_RUNTIME_DIR` is not set, so no socket path can be derived
    #[error("XDG_RUNTIME_DIR is not set; cannot create compute socket")]
    XdgNotSet,

    /// The compute worker executable could not be found
    #[error("Compute worker binary not found: {0}")]
    ComputeBinaryNotFound(String),

    /// The compute socket closed while requests were in flight
    #[error("Compute connection closed")]
    ConnectionClosed,

    /// The multiplexer reader has exited; no further requests possible
    #[error("Compute reader is dead")]
    ReaderDead,

    /// A frame header carried an unexpected magic constant
    #[error("Invalid frame magic: {0:#010x}")]
    InvalidMagic(u32),

    /// A frame declared a payload longer than the configured bound
    #[error("Frame payload too large: {length} bytes (max {max})")]
    FrameTooLarge {
        /// Declared payload length
        length: u32,
        /// Configured upper bound
        max: u32,
    },

    /// A frame payload was too short to carry its request id
    #[error("Frame payload truncated: {0} bytes")]
    FrameTruncated(usize),

    /// The compute worker reported an error for a request
    #[error("Worker error {code}: {message}")]
    WorkerReported {
        /// Worker-defined error code
        code: u32,
        /// Human-readable message from the worker
        message: String,
    },

    /// A compute request did not complete within its deadline
    #[error("Compute request timed out after {0:?}")]
    ComputeTimeout(std::time::Duration),

    /// Rate limit exceeded for an operation
    #[error("Rate limit exceeded: limit={limit}/min, {message}")]
    RateLimitExceeded {
        /// The configured per-minute limit that was exceeded
        limit: u32,
        /// Additional message explaining the failure
        message: String,
    },

    /// Session-related errors (missing, invalid id)
    #[error("Session error: {0}")]
    Session(String),

    /// SSE broker errors (no connection, at capacity, send failure)
    #[error("Event stream error: {0}")]
    Sse(String),

    /// Image encoding or storage errors
    #[error("Image error: {0}")]
    Image(String),

    /// Input validation errors (empty/oversize form fields)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WeaveError {
    /// Returns a short, user-safe description suitable for an SSE `error`
    /// event. Full diagnostics stay in the server log.
    pub fn user_message(&self) -> String {
        match self {
            WeaveError::RateLimitExceeded { message, .. } => message.clone(),
            WeaveError::WorkerReported { message, .. } => {
                format!("The image worker reported an error: {}", message)
            }
            WeaveError::ConnectionClosed | WeaveError::ReaderDead => {
                "Lost connection to the image worker.".to_string()
            }
            WeaveError::ComputeTimeout(_) => "Image generation timed out.".to_string(),
            WeaveError::XdgNotSet | WeaveError::ComputeBinaryNotFound(_) => {
                "The image worker is not available.".to_string()
            }
            WeaveError::InvalidInput(msg) => msg.clone(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

/// Result type alias for Weave operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
