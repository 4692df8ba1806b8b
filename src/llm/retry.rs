//! Three-level recovery from malformed model output
//!
//! The model must answer in the delimited format parsed by
//! [`crate::llm::metadata`]. When it does not, the controller escalates
//! through a per-call ladder (never cumulative across the
//! conversation):
//!
//! 1. **Format reminder** (at most 2 retries): append a user-role
//!    reminder showing the expected shape and try again. User role
//!    because the provider permits only one leading system message.
//! 2. **Context compaction** (1 retry): throw away the reminders and
//!    every failed assistant output; retry with a single system message
//!    summarizing the user's intent plus an explicit format example.
//! 3. **Exhausted**: give up and report the last classification; the
//!    chat handler resets the conversation and surfaces the error.
//!
//! Non-format errors (connection, timeout, stream abort) bypass the
//! ladder entirely and surface immediately.
//!
//! Tokens stream to the browser as the model produces them, so failed
//! attempts are briefly visible; each failure publishes a retry event
//! and the client discards the partial bubble when it arrives.

use std::sync::Arc;

use crate::error::Result;
use crate::llm::metadata::{parse_response, FormatError, LlmMetadata, METADATA_DELIMITER};
use crate::llm::provider::{ChatMessage, ChatProvider, TokenCallback};

/// Maximum level-1 reminder retries per chat call.
const MAX_REMINDER_RETRIES: usize = 2;

/// Maximum characters kept in the compaction summary.
const SUMMARY_MAX_CHARS: usize = 200;

/// Lead-in phrases stripped when summarizing user intent.
const FILLER_PHRASES: [&str; 8] = [
    "please",
    "can you",
    "could you",
    "would you",
    "i want you to",
    "i want",
    "i would like",
    "i'd like",
];

/// Result of a chat call after recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    /// The model produced a well-formed response
    Success {
        /// Conversational text (delimiter and JSON stripped)
        text: String,
        /// Parsed metadata
        metadata: LlmMetadata,
    },
    /// Every level failed; the conversation should be reset
    Exhausted {
        /// Classification of the final failure
        last_error: FormatError,
    },
}

/// Runs chat calls against a provider with format-error recovery.
pub struct RetryController {
    provider: Arc<dyn ChatProvider>,
}

impl RetryController {
    /// Creates a controller over the given provider.
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Executes one chat call with the full recovery ladder.
    ///
    /// `context` is the fully assembled outbound message list (history
    /// plus the new user turn). `on_token` receives streamed chunks
    /// from every attempt, in order. `on_retry` fires once per format
    /// failure that leads to another attempt or to exhaustion, letting
    /// the caller publish a retry event; its error aborts the call
    /// (the browser is gone).
    ///
    /// # Errors
    ///
    /// Non-format provider errors surface immediately without retry.
    pub async fn run(
        &self,
        context: &[ChatMessage],
        on_token: TokenCallback<'_>,
        on_retry: &(dyn Fn(usize, &FormatError) -> Result<()> + Send + Sync),
    ) -> Result<ChatOutcome> {
        let mut working: Vec<ChatMessage> = context.to_vec();
        let mut failures = 0usize;

        // Level 1: original attempt plus reminder retries.
        loop {
            let raw = self.provider.stream_chat(&working, on_token).await?;
            match parse_response(&raw) {
                Ok(parsed) => {
                    return Ok(ChatOutcome::Success {
                        text: parsed.text,
                        metadata: parsed.metadata,
                    });
                }
                Err(format_error) => {
                    failures += 1;
                    tracing::warn!(
                        attempt = failures,
                        error = %format_error,
                        "model response failed format parse"
                    );
                    on_retry(failures, &format_error)?;
                    if failures > MAX_REMINDER_RETRIES {
                        break;
                    }
                    working.push(format_reminder());
                }
            }
        }

        // Level 2: compaction. One attempt from a clean, minimal
        // context built out of the user's own words.
        let compacted = vec![compaction_message(context)];
        let raw = self.provider.stream_chat(&compacted, on_token).await?;
        match parse_response(&raw) {
            Ok(parsed) => Ok(ChatOutcome::Success {
                text: parsed.text,
                metadata: parsed.metadata,
            }),
            Err(format_error) => {
                failures += 1;
                tracing::error!(
                    attempts = failures,
                    error = %format_error,
                    "compaction retry also failed; giving up"
                );
                on_retry(failures, &format_error)?;
                Ok(ChatOutcome::Exhausted {
                    last_error: format_error,
                })
            }
        }
    }
}

/// The level-1 reminder appended after a format failure.
fn format_reminder() -> ChatMessage {
    ChatMessage::user(format!(
        "[Your previous reply was not in the required format. Reply with \
         conversational text, then a line containing exactly {delim}, then a \
         single JSON object with keys \"prompt\", \"generate_image\", \
         \"steps\", \"cfg\", \"seed\". Example:\nSure, here you go.\n{delim}\n\
         {{\"prompt\":\"a red fox in snow\",\"generate_image\":false,\
         \"steps\":20,\"cfg\":7.5,\"seed\":-1}}]",
        delim = METADATA_DELIMITER
    ))
}

/// The level-2 replacement context: one system message carrying a
/// summary of user intent plus the exact response format.
fn compaction_message(context: &[ChatMessage]) -> ChatMessage {
    let summary = summarize_user_intent(context);
    ChatMessage::system(format!(
        "The user wants: {summary}\n\nRespond with one short sentence, then a \
         line containing exactly {delim}, then a single JSON object with keys \
         \"prompt\", \"generate_image\", \"steps\", \"cfg\", \"seed\". \
         Example:\nOkay.\n{delim}\n{{\"prompt\":\"a red fox in snow\",\
         \"generate_image\":false,\"steps\":20,\"cfg\":7.5,\"seed\":-1}}",
        summary = summary,
        delim = METADATA_DELIMITER
    ))
}

/// Concatenates the user's non-bracketed messages into a lowercase,
/// filler-stripped summary capped at [`SUMMARY_MAX_CHARS`] characters.
///
/// Bracketed user messages are machine-injected (settings, prompt
/// notifications, reminders) and carry no intent of their own.
fn summarize_user_intent(context: &[ChatMessage]) -> String {
    let mut combined = context
        .iter()
        .filter(|m| m.role == "user" && !m.content.starts_with('['))
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    for phrase in FILLER_PHRASES {
        combined = combined.replace(phrase, " ");
    }
    let combined = combined.split_whitespace().collect::<Vec<_>>().join(" ");

    if combined.chars().count() > SUMMARY_MAX_CHARS {
        let truncated: String = combined.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        combined
    }
}
