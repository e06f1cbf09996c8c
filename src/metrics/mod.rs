//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_with_registry, Counter, Encoder, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Summarization engine metrics
    pub summarizations: Counter,
    pub summarization_fallbacks: Counter,
    pub messages_summarized: Counter,

    // Budget enforcement metrics
    pub budget_truncations: Counter,
    pub insufficient_context: Counter,

    // Adaptive retry metrics
    pub context_overflow_retries: Counter,

    // Persistence metrics
    pub snapshot_write_failures: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let summarizations = register_counter_with_registry!(
            Opts::new("memory_summarizations_total", "Total summarization passes started"),
            registry
        )?;

        let summarization_fallbacks = register_counter_with_registry!(
            Opts::new(
                "memory_summarization_fallbacks_total",
                "Summarization passes that fell back to the extractive summary"
            ),
            registry
        )?;

        let messages_summarized = register_counter_with_registry!(
            Opts::new(
                "memory_messages_summarized_total",
                "Messages removed from buffers by summarization"
            ),
            registry
        )?;

        let budget_truncations = register_counter_with_registry!(
            Opts::new(
                "memory_budget_truncations_total",
                "Requests degraded to the truncation placeholder"
            ),
            registry
        )?;

        let insufficient_context = register_counter_with_registry!(
            Opts::new(
                "memory_insufficient_context_total",
                "Requests refused for lack of response headroom"
            ),
            registry
        )?;

        let context_overflow_retries = register_counter_with_registry!(
            Opts::new(
                "memory_context_overflow_retries_total",
                "Provider context overflows recovered by halving"
            ),
            registry
        )?;

        let snapshot_write_failures = register_counter_with_registry!(
            Opts::new(
                "memory_snapshot_write_failures_total",
                "Snapshot persistence failures (non-fatal)"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            summarizations,
            summarization_fallbacks,
            messages_summarized,
            budget_truncations,
            insufficient_context,
            context_overflow_retries,
            snapshot_write_failures,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialize_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.summarizations.inc();
        metrics.context_overflow_retries.inc();

        let exported = metrics.export().unwrap();
        assert!(exported.contains("memory_summarizations_total"));
        assert!(exported.contains("memory_context_overflow_retries_total"));
    }

    #[test]
    fn test_global_metrics_handle() {
        METRICS.budget_truncations.inc();
        assert!(METRICS
            .export()
            .unwrap()
            .contains("memory_budget_truncations_total"));
    }
}
