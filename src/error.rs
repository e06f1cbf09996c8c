//! Error types for the conversation memory subsystem

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Raised by the budget enforcer when too little room remains for a
    /// usable model response. Non-retryable; the message carries the
    /// remediation guidance shown to the end user.
    #[error(
        "insufficient context for {model}: {tokens_used} of {context_size} tokens used, \
         {tokens_available} left for a response (minimum {recommended_minimum}); \
         switch to a larger model, clear the conversation history, or shorten the input"
    )]
    InsufficientContext {
        model: String,
        context_size: usize,
        tokens_used: usize,
        tokens_available: i64,
        recommended_minimum: usize,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("summarization failed: {0}")]
    Summarization(#[from] crate::memory::summarizer::SummarizerError),

    #[error("model call failed: {0}")]
    Model(#[from] crate::request::retry::ModelError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// True for conditions that must be surfaced to the end user as
    /// explanatory text rather than retried or downgraded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MemoryError::InsufficientContext { .. } | MemoryError::Configuration(_)
        )
    }
}
