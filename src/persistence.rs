//! Snapshot persistence for conversation buffers
//!
//! Writes fully replace the previous snapshot, never patch it, so a crash
//! mid-write can lose at most the latest turn and never corrupts stored
//! state. Failures are logged by callers and are non-fatal to the in-memory
//! buffer.

use crate::error::{MemoryError, Result};
use crate::memory::models::MemorySnapshot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Distinguishes temp files of concurrent writers to the same session
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Persistence collaborator for session snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<MemorySnapshot>>;
    async fn save(&self, snapshot: &MemorySnapshot) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// File-backed snapshot store, one JSON file per session
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        // Session ids are expected to be UUIDs; strip path separators from
        // anything else so a hostile id cannot escape the directory.
        let safe: String = session_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, session_id: &str) -> Result<Option<MemorySnapshot>> {
        let path = self.snapshot_path(session_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MemoryError::Persistence(e.to_string())),
        };

        match serde_json::from_str::<MemorySnapshot>(&contents) {
            Ok(snapshot) => {
                debug!(
                    "Loaded snapshot for session {} ({} messages)",
                    session_id,
                    snapshot.messages.len()
                );
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Ignoring corrupt snapshot at {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;

        let path = self.snapshot_path(&snapshot.session_id);
        let contents = serde_json::to_string(snapshot)
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;

        // Unique per write: two in-flight saves must never interleave their
        // bytes in a shared temp file. The rename publishes whole files only.
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.tmp{}", seq));
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MemoryError::Persistence(e.to_string()))?;

        debug!("Saved snapshot for session {}", snapshot.session_id);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.snapshot_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::Persistence(e.to_string())),
        }
    }
}

impl FileSnapshotStore {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// No-op store for tests and ephemeral sessions
pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn load(&self, _session_id: &str) -> Result<Option<MemorySnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &MemorySnapshot) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}
