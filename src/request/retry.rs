//! Adaptive retry around outbound model calls
//!
//! On a provider-reported context overflow the learned context size is
//! halved and the call retried immediately with a re-pruned message list.
//! That loop is a local budget correction, not a remote throttle, so it
//! carries no backoff; generic transient failures get a small backoff
//! instead. Binary halving converges in log2(initial/floor) steps, well
//! inside the attempt ceiling.

use super::budget::BudgetEnforcer;
use crate::error::{MemoryError, Result};
use crate::memory::models::Message;
use crate::metrics::METRICS;
use crate::sizing::{model_key, ContextSizeStore};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by the model-call collaborator
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("provider error (status {status:?}): {message}")]
    Provider { status: Option<u16>, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ModelError {
    /// Transient failures eligible for the generic backoff policy
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Network(_) => true,
            ModelError::Provider { status, .. } => {
                matches!(status, Some(429) | Some(500..=599))
            }
            ModelError::Configuration(_) => false,
        }
    }
}

/// Default context-overflow detector: case-insensitive substring matching
/// against the error vocabulary providers actually emit, plus HTTP 413.
/// Inherently fragile for non-English or reworded messages; supply a custom
/// detector per provider when that matters.
pub fn is_context_overflow(error: &ModelError) -> bool {
    if let ModelError::Provider {
        status: Some(413), ..
    } = error
    {
        return true;
    }

    let text = error.to_string().to_lowercase();
    if text.contains("prompt is too long") {
        return true;
    }
    text.contains("context")
        && (text.contains("length")
            || text.contains("limit")
            || text.contains("exceeded")
            || text.contains("too long"))
}

/// Pluggable overflow detector
pub type OverflowDetector = Arc<dyn Fn(&ModelError) -> bool + Send + Sync>;

/// Retry driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempt ceiling, overflow corrections included
    pub max_attempts: usize,
    /// Retries allowed for generic transient failures
    pub transient_retries: usize,
    /// Base delay for transient backoff (doubles per retry)
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            transient_retries: 3,
            backoff_base_ms: 200,
        }
    }
}

/// Wraps outbound model calls with budget enforcement and adaptive
/// context-size correction
pub struct AdaptiveRetryDriver {
    store: Arc<ContextSizeStore>,
    enforcer: BudgetEnforcer,
    config: RetryConfig,
    detector: OverflowDetector,
}

impl AdaptiveRetryDriver {
    pub fn new(
        store: Arc<ContextSizeStore>,
        enforcer: BudgetEnforcer,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            enforcer,
            config,
            detector: Arc::new(is_context_overflow),
        }
    }

    /// Replace the default overflow detector
    pub fn with_detector(
        mut self,
        detector: impl Fn(&ModelError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// Issue a model call, pruning the message list to the live learned
    /// context size before each attempt. The `call` closure receives the
    /// pruned messages and performs the actual request, streaming or not.
    pub async fn send<T, F, Fut>(
        &self,
        provider: &str,
        model: &str,
        messages: &[Message],
        call: F,
    ) -> Result<T>
    where
        F: Fn(Vec<Message>) -> Fut,
        Fut: Future<Output = std::result::Result<T, ModelError>>,
    {
        let key = model_key(provider, model);
        let mut transient_failures = 0usize;
        let mut last_error: Option<ModelError> = None;

        for attempt in 1..=self.config.max_attempts {
            let size = self.store.get(&key);
            // InsufficientContext propagates: shrinking the window further
            // can only make it worse.
            let pruned = self.enforcer.enforce(messages, size, &key)?;

            debug!(
                "Attempt {} for {}: {} messages within {} tokens",
                attempt,
                key,
                pruned.len(),
                size
            );

            match call(pruned).await {
                Ok(response) => return Ok(response),
                Err(e) if (self.detector)(&e) => {
                    METRICS.context_overflow_retries.inc();
                    let reduced = self.store.reduce(&key, size).await;
                    info!(
                        "Context overflow from {} on attempt {}; retrying with {} tokens",
                        key, attempt, reduced
                    );
                    last_error = Some(e);
                    // Immediate retry, no backoff
                }
                Err(e @ ModelError::Configuration(_)) => {
                    return Err(e.into());
                }
                Err(e) if e.is_transient() && transient_failures < self.config.transient_retries => {
                    transient_failures += 1;
                    let delay =
                        Duration::from_millis(self.config.backoff_base_ms * (1 << transient_failures));
                    warn!(
                        "Transient failure from {} ({}); backing off {:?}",
                        key, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Exhausted {} attempts for {}",
            self.config.max_attempts, key
        );
        match last_error {
            Some(e) => Err(e.into()),
            None => Err(MemoryError::Internal(format!(
                "exhausted {} attempts for {} without a recorded error",
                self.config.max_attempts, key
            ))),
        }
    }
}
