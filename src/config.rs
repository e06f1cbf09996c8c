//! Layered configuration
//!
//! Defaults, then an optional `memory.toml`, then `MEMORY__`-prefixed
//! environment variables (e.g. `MEMORY__BUDGET__MIN_RESPONSE_TOKENS=4096`).

use crate::memory::buffer::BufferConfig;
use crate::memory::summarizer::SummarizerConfig;
use crate::request::budget::EnforcerConfig;
use crate::request::retry::RetryConfig;
use crate::sizing::SizingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub snapshot_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from(".conversation-memory/snapshots"),
        }
    }
}

/// Full crate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub buffer: BufferConfig,
    pub summarizer: SummarizerConfig,
    pub budget: EnforcerConfig,
    pub retry: RetryConfig,
    pub sizing: SizingConfig,
    pub persistence: PersistenceConfig,
}

impl MemoryConfig {
    /// Load configuration from `memory.toml` (optional) and environment
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from("memory")
    }

    /// Load from a named config file base, with environment overrides
    pub fn load_from(name: &str) -> crate::error::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("MEMORY").separator("__"))
            .build()
            .map_err(|e| crate::error::MemoryError::Configuration(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::error::MemoryError::Configuration(e.to_string()))
    }
}
