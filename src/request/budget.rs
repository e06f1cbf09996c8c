//! Per-request token budget enforcement
//!
//! Prunes an outgoing message list to fit the model's learned context size,
//! keeping system messages and the latest turn unconditionally, and raising
//! a structured error when too little room remains for a usable response.

use crate::error::{MemoryError, Result};
use crate::memory::models::{Message, MessageRole};
use crate::memory::token_estimator::TokenEstimator;
use crate::metrics::METRICS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Placeholder sent when even the system messages exceed the budget
pub const TRUNCATION_PLACEHOLDER: &str = "[messages truncated due to size]";

/// Budget enforcer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerConfig {
    /// Fraction of the context window reserved for the model's response
    pub response_fraction: f64,
    /// Minimum viable room for a response; below this the request is refused
    pub min_response_tokens: usize,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            response_fraction: 0.2,
            min_response_tokens: 2048,
        }
    }
}

/// Prunes outgoing requests to a context-size budget
pub struct BudgetEnforcer {
    config: EnforcerConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl BudgetEnforcer {
    pub fn new(config: EnforcerConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    /// Select the messages that fit within `context_size`, preserving
    /// chronological order. Idempotent: re-applying to its own output yields
    /// the same output.
    ///
    /// Rules, in order: all system messages are kept; if they alone exceed
    /// the available budget the whole request degrades to a single
    /// placeholder system message; the newest non-system message is kept
    /// even when it alone overflows; older non-system messages are added
    /// newest-first until the first one that no longer fits.
    pub fn enforce(
        &self,
        messages: &[Message],
        context_size: usize,
        model: &str,
    ) -> Result<Vec<Message>> {
        let reserved = (context_size as f64 * self.config.response_fraction) as usize;
        let available = context_size.saturating_sub(reserved);

        let mut keep = vec![false; messages.len()];
        let mut running = 0usize;

        for (i, message) in messages.iter().enumerate() {
            if message.role == MessageRole::System {
                keep[i] = true;
                running += self.estimator.estimate_message(message);
            }
        }

        if running >= available {
            warn!(
                "System messages alone use {} of {} available tokens for {}; truncating request",
                running, available, model
            );
            METRICS.budget_truncations.inc();
            return Ok(vec![Message::system(TRUNCATION_PLACEHOLDER)]);
        }

        if let Some(latest) = messages
            .iter()
            .rposition(|m| m.role != MessageRole::System)
        {
            // The latest turn is kept regardless of cost: a request with no
            // conversational content is worse than one the provider may
            // truncate server-side.
            keep[latest] = true;
            running += self.estimator.estimate_message(&messages[latest]);

            for i in (0..latest).rev() {
                if messages[i].role == MessageRole::System {
                    continue;
                }
                let cost = self.estimator.estimate_message(&messages[i]);
                if running + cost > available {
                    break;
                }
                keep[i] = true;
                running += cost;
            }
        }

        let available_for_response = context_size as i64 - running as i64;
        if available_for_response < self.config.min_response_tokens as i64 {
            METRICS.insufficient_context.inc();
            return Err(MemoryError::InsufficientContext {
                model: model.to_string(),
                context_size,
                tokens_used: running,
                tokens_available: available_for_response,
                recommended_minimum: self.config.min_response_tokens,
            });
        }

        let kept: Vec<Message> = messages
            .iter()
            .zip(keep.iter())
            .filter(|(_, &k)| k)
            .map(|(m, _)| m.clone())
            .collect();

        debug!(
            "Budget for {}: kept {} of {} messages, {} tokens used, {} left for response",
            model,
            kept.len(),
            messages.len(),
            running,
            available_for_response
        );

        Ok(kept)
    }
}
