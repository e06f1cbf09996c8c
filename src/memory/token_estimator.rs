//! Token estimation for budget and threshold decisions

use super::models::Message;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Per-message accounting overhead (role tag plus separators). Chat APIs
/// charge a few tokens per message beyond the raw content.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for one message, including per-message overhead
    fn estimate_message(&self, message: &Message) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.estimate(&message.content)
    }

    /// Estimate total tokens for a sequence of messages
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// Word-based token estimator (default, ~1.3 tokens per word)
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Tiktoken-based estimator using cl100k_base. Higher fidelity than the word
/// heuristic; initialization can fail if the encoding tables are unavailable.
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let bpe = cl100k_base()?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
