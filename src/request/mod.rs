//! Outbound request shaping: budget enforcement and adaptive retry

pub mod budget;
pub mod retry;

pub use budget::{BudgetEnforcer, EnforcerConfig, TRUNCATION_PLACEHOLDER};
pub use retry::{
    is_context_overflow, AdaptiveRetryDriver, ModelError, OverflowDetector, RetryConfig,
};
