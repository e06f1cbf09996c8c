//! Bounded conversation memory
//!
//! The buffer keeps an unbounded dialogue inside a bounded token budget by
//! summarizing its oldest turns in the background before the budget is
//! exceeded.

pub mod buffer;
pub(crate) mod engine;
pub mod models;
pub mod summarizer;
pub mod token_estimator;

pub use buffer::{BudgetStrategy, BufferConfig, ConversationBuffer, DEFAULT_BUDGET_FRACTION};
pub use models::{MemorySnapshot, Message, MessageRole, StructuredSummary};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerConfig, SummarizerError};
pub use token_estimator::{
    TiktokenEstimator, TokenEstimator, WordBasedEstimator, MESSAGE_OVERHEAD_TOKENS,
};
