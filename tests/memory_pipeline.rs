//! Integration tests for the conversation memory pipeline
//!
//! Exercises the buffer, summarization engine, context size store, budget
//! enforcer and retry driver together through the public API.

use async_trait::async_trait;
use conversation_memory::memory::{
    BudgetStrategy, BufferConfig, ConversationBuffer, LlmSummarizer, Message, MessageRole,
    StructuredSummary, Summarizer, SummarizerConfig, SummarizerError, TokenEstimator,
};
use conversation_memory::request::{BudgetEnforcer, EnforcerConfig, RetryConfig};
use conversation_memory::sizing::{model_key, SizingConfig};
use conversation_memory::{
    AdaptiveRetryDriver, ContextSizeStore, FileSnapshotStore, MemoryError, ModelError,
    NullSnapshotStore, SnapshotStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route library tracing through the test harness; `RUST_LOG` overrides.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

/// One token per content character, no per-message overhead. Makes token
/// arithmetic in assertions exact.
struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len()
    }
    fn estimate_message(&self, message: &Message) -> usize {
        message.content.len()
    }
}

struct StructuredStub;

#[async_trait]
impl Summarizer for StructuredStub {
    async fn summarize(&self, conversation: &str) -> Result<StructuredSummary, SummarizerError> {
        let mut summary = StructuredSummary::default();
        summary
            .key_facts
            .insert("chars_seen".to_string(), conversation.len().to_string());
        summary.main_topics.insert("testing".to_string());
        summary.recent_context = "Test conversation in progress".to_string();
        Ok(summary)
    }
}

struct FailingStub;

#[async_trait]
impl Summarizer for FailingStub {
    async fn summarize(&self, _: &str) -> Result<StructuredSummary, SummarizerError> {
        Err(SummarizerError::NetworkError("unreachable".to_string()))
    }
}

fn buffer_with(
    summarizer: Arc<dyn Summarizer>,
    budget: BudgetStrategy,
    snapshots: Arc<dyn SnapshotStore>,
) -> ConversationBuffer {
    ConversationBuffer::new(
        format!("it-{}", uuid::Uuid::new_v4()),
        Arc::new(CharEstimator),
        summarizer,
        snapshots,
        budget,
        BufferConfig::default(),
    )
}

async fn wait_for_shrink(buffer: &ConversationBuffer, target_len: usize) {
    for _ in 0..300 {
        if buffer.len() <= target_len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "buffer never shrank to {} messages (still {})",
        target_len,
        buffer.len()
    );
}

#[tokio::test]
async fn buffer_summarizes_oldest_messages_past_threshold() {
    init_tracing();
    // 10 messages x 500 tokens = 5000 > 0.6 * 6000; the oldest 45% (5
    // messages) are summarized away.
    let buffer = buffer_with(
        Arc::new(StructuredStub),
        BudgetStrategy::Fixed(6_000),
        Arc::new(NullSnapshotStore),
    );
    for i in 0..10 {
        buffer.add(Message::user(format!("{:0>500}", i)));
    }
    wait_for_shrink(&buffer, 5).await;

    assert_eq!(buffer.len(), 5);
    let snapshot = buffer.export_snapshot();
    let summary = snapshot.structured_summary.expect("structured summary");
    assert!(summary.main_topics.contains("testing"));

    // The synthetic summary message leads the projection
    let read = buffer.read();
    assert_eq!(read[0].role, MessageRole::System);
    assert!(read[0].content.contains("Test conversation"));
    // Surviving messages are the newest ones, still in order
    assert!(read[1].content.ends_with('5'));
    assert!(read.last().unwrap().content.ends_with('9'));
}

#[tokio::test]
async fn failed_summarizer_leaves_extractive_summary() {
    init_tracing();
    let buffer = buffer_with(
        Arc::new(FailingStub),
        BudgetStrategy::Fixed(6_000),
        Arc::new(NullSnapshotStore),
    );
    for i in 0..10 {
        buffer.add(Message::user(format!(
            "turn {} {}",
            i,
            "x".repeat(490)
        )));
    }
    wait_for_shrink(&buffer, 5).await;

    let snapshot = buffer.export_snapshot();
    assert!(snapshot.structured_summary.is_none());
    let basic = snapshot.basic_summary.expect("basic summary");
    // First two and last two of the removed batch, truncated
    assert!(basic.contains("turn 0"));
    assert!(basic.contains("turn 1"));
    assert!(basic.contains("turn 3"));
    assert!(basic.contains("turn 4"));
    assert!(basic.contains("..."));
}

#[tokio::test]
async fn summary_survives_merge_across_passes() {
    init_tracing();
    let mut first = StructuredSummary::default();
    first.key_facts.insert("a".to_string(), "1".to_string());
    first.main_topics.insert("alpha".to_string());
    first.recent_context = "first".to_string();

    let mut second = StructuredSummary::default();
    second.key_facts.insert("a".to_string(), "2".to_string());
    second.key_facts.insert("b".to_string(), "3".to_string());
    second.main_topics.insert("alpha".to_string());
    second.main_topics.insert("beta".to_string());
    second.recent_context = "second".to_string();

    first.merge(second);
    assert_eq!(first.key_facts.get("a").map(String::as_str), Some("2"));
    assert_eq!(first.key_facts.get("b").map(String::as_str), Some("3"));
    assert_eq!(first.main_topics.len(), 2);
    assert_eq!(first.recent_context, "second");
}

#[tokio::test]
async fn overflow_retry_shrinks_store_and_tightens_buffer_budget() {
    init_tracing();
    let store = Arc::new(ContextSizeStore::in_memory());
    let key = model_key("openai", "gpt-4");

    // The buffer derives its budget from the same store the driver corrects.
    let buffer = buffer_with(
        Arc::new(StructuredStub),
        BudgetStrategy::from_store(Arc::clone(&store), "openai", "gpt-4"),
        Arc::new(NullSnapshotStore),
    );
    let before = buffer.max_tokens();

    let driver = AdaptiveRetryDriver::new(
        Arc::clone(&store),
        BudgetEnforcer::new(EnforcerConfig::default(), Arc::new(CharEstimator)),
        RetryConfig::default(),
    );

    let attempts = AtomicUsize::new(0);
    let messages = vec![Message::user("hello there")];
    let reply = driver
        .send("openai", "gpt-4", &messages, |pruned| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                assert_eq!(pruned.len(), 1);
                if n == 0 {
                    Err(ModelError::Provider {
                        status: None,
                        message: "This model's maximum context length exceeded".to_string(),
                    })
                } else {
                    Ok("hi".to_string())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(reply, "hi");
    assert_eq!(store.get(&key), 131_072);
    // The buffer's live budget halves without being told
    assert_eq!(buffer.max_tokens(), before / 2);
}

#[tokio::test]
async fn insufficient_context_is_terminal_and_actionable() {
    init_tracing();
    let store = Arc::new(ContextSizeStore::in_memory());
    let driver = AdaptiveRetryDriver::new(
        Arc::clone(&store),
        BudgetEnforcer::new(EnforcerConfig::default(), Arc::new(CharEstimator)),
        RetryConfig::default(),
    );

    let messages = vec![
        Message::new(MessageRole::System, "s".repeat(200)),
        Message::user("u".repeat(500_000)),
    ];

    let called = AtomicUsize::new(0);
    let result: conversation_memory::Result<String> = driver
        .send("ollama", "llama3", &messages, |_| {
            called.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::Network("unexpected call".to_string())) }
        })
        .await;
    assert_eq!(called.load(Ordering::SeqCst), 0, "call must not be issued");

    let err = result.unwrap_err();
    assert!(err.is_terminal());
    match err {
        MemoryError::InsufficientContext {
            model,
            tokens_available,
            recommended_minimum,
            ..
        } => {
            assert_eq!(model, "ollama:llama3");
            assert!(tokens_available < recommended_minimum as i64);
        }
        other => panic!("expected InsufficientContext, got {:?}", other),
    }
}

#[tokio::test]
async fn snapshot_restores_session_across_buffers() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("memory-it-{}", uuid::Uuid::new_v4()));
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(&dir));

    let buffer = ConversationBuffer::new(
        "session-42",
        Arc::new(CharEstimator),
        Arc::new(StructuredStub),
        Arc::clone(&snapshots),
        BudgetStrategy::Fixed(1_000_000),
        BufferConfig::default(),
    );
    buffer.add(Message::user("remember me"));
    buffer.add(Message::assistant("noted"));

    // Persistence is fire-and-forget; wait for the write to land.
    let mut restored_len = 0;
    for _ in 0..300 {
        let restored = ConversationBuffer::for_session(
            "session-42",
            Arc::new(CharEstimator),
            Arc::new(StructuredStub),
            Arc::clone(&snapshots),
            BudgetStrategy::Fixed(1_000_000),
            BufferConfig::default(),
        )
        .await;
        restored_len = restored.len();
        if restored_len == 2 {
            assert_eq!(restored.read()[0].content, "remember me");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(restored_len, 2);

    // Deleting the session removes the snapshot too
    buffer.discard().await;
    let empty = ConversationBuffer::for_session(
        "session-42",
        Arc::new(CharEstimator),
        Arc::new(StructuredStub),
        Arc::clone(&snapshots),
        BudgetStrategy::Fixed(1_000_000),
        BufferConfig::default(),
    )
    .await;
    assert!(empty.is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn context_size_store_persists_reductions() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("sizes-it-{}.json", uuid::Uuid::new_v4()));
    let config = SizingConfig {
        path: Some(path.clone()),
        ..Default::default()
    };

    let store = ContextSizeStore::new(config.clone());
    let key = model_key("openai", "gpt-4");
    let mut size = store.get(&key);
    for expected in [131_072, 65_536, 32_768] {
        size = store.reduce(&key, size).await;
        assert_eq!(size, expected);
    }

    let reloaded = ContextSizeStore::new(config);
    assert_eq!(reloaded.get(&key), 32_768);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn llm_summarizer_parses_structured_reply() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "{\"key_facts\": {\"user_name\": \"Ada\"}, \
                            \"main_topics\": [\"engines\"], \
                            \"recent_context\": \"Designing an engine\"}"
            }
        }]
    });
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await;

    let summarizer = LlmSummarizer::new(SummarizerConfig {
        endpoint: format!("{}/v1/chat/completions", server.url()),
        ..Default::default()
    })
    .unwrap();

    let summary = summarizer
        .summarize("user: hello\nassistant: hi")
        .await
        .unwrap();
    assert_eq!(
        summary.key_facts.get("user_name").map(String::as_str),
        Some("Ada")
    );
    assert!(summary.main_topics.contains("engines"));
    assert_eq!(summary.recent_context, "Designing an engine");
    mock.assert_async().await;
}

#[tokio::test]
async fn llm_summarizer_failure_is_reported_not_panicked() {
    init_tracing();
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body("boom")
        .expect_at_least(1)
        .create_async()
        .await;

    let summarizer = LlmSummarizer::new(SummarizerConfig {
        endpoint: format!("{}/v1/chat/completions", server.url()),
        max_retries: 2,
        ..Default::default()
    })
    .unwrap();

    let result = summarizer.summarize("user: hello").await;
    assert!(matches!(result, Err(SummarizerError::ApiError(_))));
}
