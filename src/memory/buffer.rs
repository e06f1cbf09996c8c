//! Token-aware conversation buffer with background summarization
//!
//! One buffer owns the ordered message history of a single chat session.
//! `add` never blocks on summarization: when the estimated total crosses the
//! threshold fraction of the live budget, a summarization pass is spawned on
//! the runtime, guarded so at most one runs per buffer at a time. The buffer
//! is `Clone`; a session's text and vision clients share the same instance.

use super::engine;
use super::models::{MemorySnapshot, Message, MessageRole, StructuredSummary};
use super::summarizer::Summarizer;
use super::token_estimator::TokenEstimator;
use crate::metrics::METRICS;
use crate::persistence::SnapshotStore;
use crate::sizing::{model_key, ContextSizeStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Fraction of the model's context window a buffer may occupy before pruning
pub const DEFAULT_BUDGET_FRACTION: f64 = 0.4;

/// Buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Summarization triggers above this fraction of `max_tokens`
    pub threshold_fraction: f64,
    /// Fraction of eligible (non-system) messages one pass summarizes
    pub summary_batch_fraction: f64,
    /// Deadline for one summarizer call
    pub summarize_timeout_secs: u64,
    /// Per-message excerpt length in the extractive fallback
    pub excerpt_chars: usize,
    /// Per-call basic summary cap; the stored summary is capped at twice this
    pub basic_summary_cap: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.6,
            summary_batch_fraction: 0.45,
            summarize_timeout_secs: 45,
            excerpt_chars: 150,
            basic_summary_cap: 1200,
        }
    }
}

impl BufferConfig {
    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_secs(self.summarize_timeout_secs)
    }
}

/// How a buffer resolves its token budget.
///
/// The derived variant recomputes from the live context size store on every
/// check, so a size reduction discovered by the retry driver immediately
/// tightens the summarization threshold.
pub enum BudgetStrategy {
    /// Constant budget, mainly for tests and offline tooling
    Fixed(usize),
    /// Fraction of the learned context size for the active provider/model
    FromStore {
        store: Arc<ContextSizeStore>,
        provider: String,
        model: String,
        fraction: f64,
    },
}

impl BudgetStrategy {
    pub fn from_store(
        store: Arc<ContextSizeStore>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::FromStore {
            store,
            provider: provider.into(),
            model: model.into(),
            fraction: DEFAULT_BUDGET_FRACTION,
        }
    }

    /// Current token budget for the buffer. Always recomputed, never cached.
    pub fn max_tokens(&self) -> usize {
        match self {
            BudgetStrategy::Fixed(tokens) => *tokens,
            BudgetStrategy::FromStore {
                store,
                provider,
                model,
                fraction,
            } => {
                let size = store.get(&model_key(provider, model));
                (size as f64 * fraction).floor() as usize
            }
        }
    }
}

#[derive(Default)]
struct BufferState {
    messages: Vec<Message>,
    structured_summary: Option<StructuredSummary>,
    basic_summary: Option<String>,
}

struct BufferInner {
    session_id: String,
    state: Mutex<BufferState>,
    /// Held for the whole of a summarization pass; `clear` takes it with a
    /// blocking acquire so it can never race a prune.
    summarize_guard: Arc<tokio::sync::Mutex<()>>,
    /// Serializes snapshot writes. The export is taken under this lock, so
    /// each completed write carries state at least as new as the one before
    /// it; a slow writer can never publish stale state over a newer write.
    persist_lock: tokio::sync::Mutex<()>,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
    snapshots: Arc<dyn SnapshotStore>,
    budget: BudgetStrategy,
    config: BufferConfig,
}

/// Per-session conversation buffer
#[derive(Clone)]
pub struct ConversationBuffer {
    inner: Arc<BufferInner>,
}

impl ConversationBuffer {
    pub fn new(
        session_id: impl Into<String>,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Arc<dyn Summarizer>,
        snapshots: Arc<dyn SnapshotStore>,
        budget: BudgetStrategy,
        config: BufferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                session_id: session_id.into(),
                state: Mutex::new(BufferState::default()),
                summarize_guard: Arc::new(tokio::sync::Mutex::new(())),
                persist_lock: tokio::sync::Mutex::new(()),
                estimator,
                summarizer,
                snapshots,
                budget,
                config,
            }),
        }
    }

    /// Create a buffer for a session, restoring its persisted snapshot when
    /// one exists. Load failures are logged and start the buffer empty.
    pub async fn for_session(
        session_id: impl Into<String>,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Arc<dyn Summarizer>,
        snapshots: Arc<dyn SnapshotStore>,
        budget: BudgetStrategy,
        config: BufferConfig,
    ) -> Self {
        let buffer = Self::new(session_id, estimator, summarizer, snapshots, budget, config);
        match buffer.inner.snapshots.load(&buffer.inner.session_id).await {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored session {} ({} messages)",
                    buffer.inner.session_id,
                    snapshot.messages.len()
                );
                buffer.load_snapshot(snapshot).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "Could not restore session {}: {}",
                    buffer.inner.session_id, e
                );
            }
        }
        buffer
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Append a message. Returns immediately; summarization and persistence
    /// happen on spawned tasks. Must be called within a tokio runtime.
    pub fn add(&self, message: Message) {
        let total_tokens = {
            let mut state = self.inner.state.lock().unwrap();
            state.messages.push(message);
            self.inner.estimator.estimate_messages(&state.messages)
        };
        self.schedule_persist();

        let max_tokens = self.max_tokens();
        let threshold = (max_tokens as f64 * self.inner.config.threshold_fraction) as usize;
        if total_tokens > threshold {
            debug!(
                "Session {} at {} of {} tokens (threshold {}), requesting summarization",
                self.inner.session_id, total_tokens, max_tokens, threshold
            );
            self.try_start_summarization();
        }
    }

    /// Project the buffer for an outgoing request: one synthetic system
    /// message rendering the current summary (structured preferred), then
    /// every non-blank message in insertion order. Never mutates state.
    pub fn read(&self) -> Vec<Message> {
        let state = self.inner.state.lock().unwrap();
        let mut out = Vec::with_capacity(state.messages.len() + 1);
        if let Some(summary) = &state.structured_summary {
            out.push(Message::system(summary.render()));
        } else if let Some(basic) = &state.basic_summary {
            out.push(Message::system(format!(
                "Summary of earlier conversation:\n{}",
                basic
            )));
        }
        out.extend(state.messages.iter().filter(|m| !m.is_blank()).cloned());
        out
    }

    /// Empty the buffer and both summary slots. Waits for any in-flight
    /// summarization to finish first.
    pub async fn clear(&self) {
        let _guard = self.inner.summarize_guard.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.messages.clear();
            state.structured_summary = None;
            state.basic_summary = None;
        }
        self.persist_now().await;
        info!("Cleared session {}", self.inner.session_id);
    }

    /// Clear the buffer and delete its persisted snapshot
    pub async fn discard(&self) {
        let _guard = self.inner.summarize_guard.lock().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.messages.clear();
            state.structured_summary = None;
            state.basic_summary = None;
        }
        if let Err(e) = self.inner.snapshots.delete(&self.inner.session_id).await {
            warn!(
                "Could not delete snapshot for session {}: {}",
                self.inner.session_id, e
            );
        }
    }

    /// Replace the buffer's full state from a snapshot. Waits for any
    /// in-flight summarization first, so a concurrent prune can never remove
    /// messages from the freshly loaded state.
    pub async fn load_snapshot(&self, snapshot: MemorySnapshot) {
        let _guard = self.inner.summarize_guard.lock().await;
        let mut state = self.inner.state.lock().unwrap();
        state.messages = snapshot.messages;
        state.structured_summary = snapshot.structured_summary;
        state.basic_summary = snapshot.basic_summary;
    }

    /// Export the buffer's full state for persistence
    pub fn export_snapshot(&self) -> MemorySnapshot {
        let state = self.inner.state.lock().unwrap();
        MemorySnapshot::new(
            self.inner.session_id.clone(),
            state.messages.clone(),
            state.structured_summary.clone(),
            state.basic_summary.clone(),
        )
    }

    /// Number of buffered messages (summaries excluded)
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated token total of the buffered messages
    pub fn total_tokens(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        self.inner.estimator.estimate_messages(&state.messages)
    }

    /// Live token budget, resolved through the configured strategy
    pub fn max_tokens(&self) -> usize {
        self.inner.budget.max_tokens()
    }

    /// Bounded drain for shutdown: wait up to `timeout` for any in-flight
    /// summarization to finish. Returns false if it was still running at
    /// the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.summarize_guard.lock())
            .await
            .is_ok()
    }

    fn try_start_summarization(&self) {
        let Ok(permit) = Arc::clone(&self.inner.summarize_guard).try_lock_owned() else {
            debug!(
                "Summarization already in flight for session {}, skipping trigger",
                self.inner.session_id
            );
            return;
        };
        let buffer = self.clone();
        tokio::spawn(async move {
            buffer.run_summarization(permit).await;
        });
    }

    /// One summarization pass. The owned permit is released on every exit
    /// path, including timeout and panic, when it drops with the task.
    async fn run_summarization(&self, _permit: OwnedMutexGuard<()>) {
        let (indices, selected) = self.select_summary_batch();
        if selected.is_empty() {
            return;
        }
        METRICS.summarizations.inc();

        let conversation = engine::render_conversation(&selected);
        let timeout = self.inner.config.summarize_timeout();
        let outcome =
            tokio::time::timeout(timeout, self.inner.summarizer.summarize(&conversation)).await;

        match outcome {
            Ok(Ok(summary)) => {
                let mut state = self.inner.state.lock().unwrap();
                match &mut state.structured_summary {
                    Some(existing) => existing.merge(summary),
                    None => state.structured_summary = Some(summary),
                }
                remove_indices(&mut state.messages, &indices);
                info!(
                    "Session {}: summarized {} messages into structured summary",
                    self.inner.session_id,
                    indices.len()
                );
            }
            Ok(Err(e)) => {
                warn!(
                    "Session {}: summarizer failed ({}), using extractive fallback",
                    self.inner.session_id, e
                );
                self.apply_basic_fallback(&indices, &selected);
            }
            Err(_) => {
                warn!(
                    "Session {}: summarizer timed out after {:?}, using extractive fallback",
                    self.inner.session_id, timeout
                );
                self.apply_basic_fallback(&indices, &selected);
            }
        }

        METRICS
            .messages_summarized
            .inc_by(indices.len() as f64);
        self.persist_now().await;
    }

    /// Oldest ~45% of non-system messages, as (stable indices, clones).
    /// System messages carry standing instructions and are never eligible.
    /// Indices stay valid until removal: `add` only appends, and removal
    /// happens while the summarize guard is held.
    fn select_summary_batch(&self) -> (Vec<usize>, Vec<Message>) {
        let state = self.inner.state.lock().unwrap();
        let eligible: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != MessageRole::System)
            .map(|(i, _)| i)
            .collect();
        let count =
            engine::summary_batch_size(eligible.len(), self.inner.config.summary_batch_fraction);
        let indices: Vec<usize> = eligible.into_iter().take(count).collect();
        let selected = indices.iter().map(|&i| state.messages[i].clone()).collect();
        (indices, selected)
    }

    fn apply_basic_fallback(&self, indices: &[usize], selected: &[Message]) {
        METRICS.summarization_fallbacks.inc();
        let bullets = engine::basic_fallback_bullets(selected, self.inner.config.excerpt_chars);
        let cap = self.inner.config.basic_summary_cap * 2;

        let mut state = self.inner.state.lock().unwrap();
        let combined = engine::append_capped(state.basic_summary.as_deref(), &bullets, cap);
        state.basic_summary = Some(combined);
        remove_indices(&mut state.messages, indices);
    }

    fn schedule_persist(&self) {
        let buffer = self.clone();
        tokio::spawn(async move {
            buffer.persist_now().await;
        });
    }

    async fn persist_now(&self) {
        let _writer = self.inner.persist_lock.lock().await;
        let snapshot = self.export_snapshot();
        if let Err(e) = self.inner.snapshots.save(&snapshot).await {
            METRICS.snapshot_write_failures.inc();
            warn!(
                "Failed to persist session {}: {}",
                self.inner.session_id, e
            );
        }
    }
}

/// Remove messages at the given ascending indices
fn remove_indices(messages: &mut Vec<Message>, indices: &[usize]) {
    for &index in indices.iter().rev() {
        if index < messages.len() {
            messages.remove(index);
        }
    }
}
