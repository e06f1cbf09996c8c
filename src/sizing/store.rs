//! Learned context size store with file-backed persistence
//!
//! Maps `provider:model` keys to the effective context window discovered at
//! runtime. Entries only ever shrink (halving on overflow, floored); a full
//! invalidation is the only way back to provider defaults.

use super::defaults::{provider_default, CONTEXT_SIZE_FLOOR};
use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Context size store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Persisted table location; `None` keeps the store in memory only
    pub path: Option<PathBuf>,
    /// Minimum size `reduce` will ever store
    pub floor: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            path: None,
            floor: CONTEXT_SIZE_FLOOR,
        }
    }
}

/// Learned, persisted context sizes. Reads are lock-free; mutations go
/// through a single writer lock so two racing overflow events cannot lose
/// each other's update on disk.
pub struct ContextSizeStore {
    learned: DashMap<String, usize>,
    config: SizingConfig,
    write_lock: Mutex<()>,
}

impl ContextSizeStore {
    /// Create a store, loading any persisted table. Load is best-effort: a
    /// missing or corrupt file starts the store empty and never fails
    /// session startup.
    pub fn new(config: SizingConfig) -> Self {
        let learned = DashMap::new();
        if let Some(ref path) = config.path {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<BTreeMap<String, usize>>(&contents) {
                    Ok(table) => {
                        for (key, size) in table {
                            learned.insert(key, size.max(config.floor));
                        }
                        info!("Loaded {} learned context sizes from {:?}", learned.len(), path);
                    }
                    Err(e) => {
                        warn!("Ignoring corrupt context size table at {:?}: {}", path, e);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Could not read context size table at {:?}: {}", path, e);
                }
            }
        }

        Self {
            learned,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// In-memory store with default floor, no persistence
    pub fn in_memory() -> Self {
        Self::new(SizingConfig::default())
    }

    /// Effective context size for a model key: learned value if present,
    /// else the provider's static default, else the global fallback.
    /// Always positive.
    pub fn get(&self, key: &str) -> usize {
        if let Some(size) = self.learned.get(key) {
            return *size;
        }
        let provider = key.split(':').next().unwrap_or(key);
        provider_default(provider)
    }

    /// Halve the stored size for a key (floored) and persist immediately.
    /// Returns the new size.
    pub async fn reduce(&self, key: &str, current: usize) -> usize {
        let _guard = self.write_lock.lock().await;
        let next = (current / 2).max(self.config.floor);
        self.learned.insert(key.to_string(), next);
        info!("Reduced context size for {} to {} tokens", key, next);
        if let Err(e) = self.persist().await {
            warn!("Failed to persist context size table: {}", e);
        }
        next
    }

    /// Drop all learned entries and delete the persisted file. Subsequent
    /// `get` calls fall back to provider defaults.
    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;
        self.learned.clear();
        if let Some(ref path) = self.config.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Deleted context size table at {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete context size table at {:?}: {}", path, e),
            }
        }
        info!("Context size store invalidated; provider defaults restored");
    }

    /// Number of learned entries
    pub fn len(&self) -> usize {
        self.learned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learned.is_empty()
    }

    /// Subscribe to the event bus, clearing the store on an invalidation
    /// broadcast. Spawns a passive listener task.
    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MemoryEvent::InvalidateContextSizes) => store.clear().await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Context size listener lagged, skipped {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Write the full table, replacing the previous file. Caller holds the
    /// write lock.
    async fn persist(&self) -> Result<()> {
        let Some(ref path) = self.config.path else {
            return Ok(());
        };

        let table: BTreeMap<String, usize> = self
            .learned
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let contents = serde_json::to_string_pretty(&table)
            .map_err(|e| crate::error::MemoryError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| crate::error::MemoryError::Persistence(e.to_string()))?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| crate::error::MemoryError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| crate::error::MemoryError::Persistence(e.to_string()))?;

        debug!("Persisted {} context size entries to {:?}", table.len(), path);
        Ok(())
    }
}
