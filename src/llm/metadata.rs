//! Structured metadata parsing for assistant responses
//!
//! The model is required to answer with free-form conversational text,
//! then a line containing exactly `---`, then a JSON object carrying
//! five required keys: `prompt`, `generate_image`, `steps`, `cfg`,
//! `seed`. This module splits a raw response into its conversational
//! half and its typed metadata, classifying failures so the retry
//! controller can choose a recovery level.
//!
//! The first delimiter wins: models occasionally hallucinate several
//! turns in one response, and everything from the second delimiter on
//! is ignored once the first JSON object has been read.
//!
//! The required-key check inspects the raw JSON object, not the typed
//! struct: typed deserialization would default-fill an absent key and
//! make it indistinguishable from a present zero value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The delimiter line separating text from metadata.
pub const METADATA_DELIMITER: &str = "---";

/// Keys every metadata object must carry.
const REQUIRED_KEYS: [&str; 5] = ["prompt", "generate_image", "steps", "cfg", "seed"];

/// Typed metadata appended to every assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMetadata {
    /// Image prompt the model settled on (possibly empty)
    pub prompt: String,
    /// Whether the model wants an image generated now
    pub generate_image: bool,
    /// Requested diffusion steps
    pub steps: i64,
    /// Requested guidance scale
    pub cfg: f64,
    /// Requested seed (-1 = random)
    pub seed: i64,
}

/// A fully parsed assistant response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// Conversational text before the delimiter, trailing newline
    /// stripped
    pub text: String,
    /// The typed metadata object
    pub metadata: LlmMetadata,
}

/// Classified parse failures, one per retry-relevant shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// No line in the response equals `---`
    #[error("response has no `---` delimiter line")]
    MissingDelimiter,

    /// Text after the delimiter is not parseable JSON
    #[error("metadata is not valid JSON: {0}")]
    InvalidJson(String),

    /// JSON parsed but required keys are absent
    #[error("metadata is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

/// Splits a raw model response at the first delimiter and parses the
/// metadata object after it.
///
/// # Errors
///
/// Returns a [`FormatError`] classifying the failure; the caller's
/// retry ladder keys off the classification.
pub fn parse_response(raw: &str) -> Result<ParsedResponse, FormatError> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let delimiter_index = lines
        .iter()
        .position(|line| line.trim_end_matches('\r') == METADATA_DELIMITER)
        .ok_or(FormatError::MissingDelimiter)?;

    let text = lines[..delimiter_index].join("\n").trim_end().to_string();
    let json_region = lines[delimiter_index + 1..].join("\n");

    // Read the first JSON value only; hallucinated extra turns after it
    // are discarded.
    let mut stream = serde_json::Deserializer::from_str(&json_region).into_iter::<serde_json::Value>();
    let value = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) => return Err(FormatError::InvalidJson(e.to_string())),
        None => return Err(FormatError::InvalidJson("no JSON after delimiter".to_string())),
    };

    let object = value
        .as_object()
        .ok_or_else(|| FormatError::InvalidJson("metadata is not a JSON object".to_string()))?;

    let missing: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|key| !object.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(FormatError::MissingFields(missing));
    }

    let metadata: LlmMetadata = serde_json::from_value(value.clone())
        .map_err(|e| FormatError::InvalidJson(e.to_string()))?;

    Ok(ParsedResponse { text, metadata })
}
