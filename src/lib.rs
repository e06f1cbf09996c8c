//! Bounded conversation memory with adaptive context budgets
//!
//! Keeps a growing dialogue inside a model's context window:
//!
//! - [`memory::ConversationBuffer`] holds a session's messages and triggers
//!   background summarization before the token budget overflows.
//! - [`request::BudgetEnforcer`] prunes each outgoing request to the learned
//!   context size, always preserving system messages and the latest turn.
//! - [`sizing::ContextSizeStore`] learns each model's effective context
//!   window by halving on provider overflow errors, persisted across runs.
//! - [`request::AdaptiveRetryDriver`] ties them together: detect overflow,
//!   shrink, retry immediately.

pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod persistence;
pub mod request;
pub mod sizing;

pub use config::MemoryConfig;
pub use error::{MemoryError, Result};
pub use events::{EventBus, MemoryEvent};
pub use memory::{
    BudgetStrategy, ConversationBuffer, MemorySnapshot, Message, MessageRole, StructuredSummary,
};
pub use persistence::{FileSnapshotStore, NullSnapshotStore, SnapshotStore};
pub use request::{AdaptiveRetryDriver, BudgetEnforcer, ModelError};
pub use sizing::ContextSizeStore;
