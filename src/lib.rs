//! Weave - desktop image-generation orchestrator library
//!
//! This library sits between a conversational language model, a GPU
//! compute worker process, and concurrent browser sessions.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `session`: per-session conversation state, settings, and the store
//! - `llm`: provider abstraction, response parsing, retry recovery
//! - `compute`: frame codec, request multiplexer, worker lifecycle
//! - `server`: HTTP surface, SSE broker, rate limiting
//! - `images`: PNG encoding and the byte-capped image store
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weave::{config::Config, llm::OllamaProvider, server::AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let provider = Arc::new(OllamaProvider::new(config.provider.ollama.clone())?);
//!     let state = AppState::new(config, provider);
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     weave::server::serve(state, cancel).await
//! }
//! ```

pub mod cli;
pub mod compute;
pub mod config;
pub mod error;
pub mod images;
pub mod llm;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, WeaveError};
pub use server::AppState;
