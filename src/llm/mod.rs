//! Language-model backend: provider abstraction, response parsing, and
//! format-error recovery.

pub mod metadata;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::{Result, WeaveError};

pub use metadata::{parse_response, FormatError, LlmMetadata, ParsedResponse};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use provider::{ChatMessage, ChatProvider, TokenCallback};
pub use retry::{ChatOutcome, RetryController};

/// Builds the configured provider.
///
/// # Errors
///
/// Returns [`WeaveError::Config`] for an unknown provider type, or the
/// provider's own construction error.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider_type.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(config.ollama.clone())?)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config.openai.clone())?)),
        other => Err(WeaveError::Config(format!("unknown provider type: {}", other)).into()),
    }
}
