//! AI-assisted summarization producing structured summaries

use super::models::StructuredSummary;
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Summarizer trait. Any failure is treated identically by the engine: it
/// falls back to the extractive basic summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Distill rendered conversation text into a structured summary
    async fn summarize(&self, conversation: &str) -> Result<StructuredSummary, SummarizerError>;
}

/// Configuration for the LLM-backed summarizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub max_summary_tokens: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            max_summary_tokens: 600,
        }
    }
}

impl SummarizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// LLM-backed summarizer using an OpenAI-compatible chat completions API
pub struct LlmSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl LlmSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SummarizerError::InitializationError(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn build_prompt(&self, conversation: &str) -> String {
        format!(
            "Summarize the following conversation. Respond with a single JSON object \
             with exactly these keys: \"key_facts\" (object mapping short fact names to \
             values worth remembering long-term), \"main_topics\" (array of topic \
             strings), \"recent_context\" (one short paragraph recapping the latest \
             turns). No prose outside the JSON.\n\n{}",
            conversation
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, conversation: &str) -> Result<StructuredSummary, SummarizerError> {
        if conversation.trim().is_empty() {
            return Ok(StructuredSummary::default());
        }

        debug!(
            "Summarizing {} chars of conversation via {}",
            conversation.len(),
            self.config.model
        );

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You extract durable facts and topics from conversations and \
                              reply with strict JSON only."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: self.build_prompt(conversation),
                },
            ],
            max_tokens: Some(self.config.max_summary_tokens),
            temperature: Some(0.3),
        };

        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} for summarization", attempt);
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }

            let mut req = self.client.post(&self.config.endpoint).json(&request);
            if let Some(ref api_key) = self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            match req.send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        last_error =
                            Some(SummarizerError::ApiError(format!("HTTP {}: {}", status, body)));
                        continue;
                    }

                    match response.json::<ChatCompletionResponse>().await {
                        Ok(resp) => match resp.choices.first() {
                            Some(choice) => {
                                return parse_structured_summary(&choice.message.content)
                            }
                            None => {
                                last_error = Some(SummarizerError::ApiError(
                                    "No choices in response".to_string(),
                                ));
                            }
                        },
                        Err(e) => {
                            last_error = Some(SummarizerError::ApiError(format!(
                                "Failed to parse response: {}",
                                e
                            )));
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(SummarizerError::NetworkError(e.to_string()));
                }
            }
        }

        warn!(
            "Summarization failed after {} attempts",
            self.config.max_retries
        );
        Err(last_error.unwrap_or(SummarizerError::Unknown))
    }
}

/// Parse the model's reply into a structured summary. Tolerates surrounding
/// prose and markdown code fences by extracting the outermost JSON object.
pub fn parse_structured_summary(content: &str) -> Result<StructuredSummary, SummarizerError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(SummarizerError::MalformedOutput(
                "no JSON object in summarizer reply".to_string(),
            ))
        }
    };

    let raw: RawSummary = serde_json::from_str(json)
        .map_err(|e| SummarizerError::MalformedOutput(e.to_string()))?;

    let mut summary = StructuredSummary {
        key_facts: raw.key_facts,
        ..Default::default()
    };
    for topic in raw.main_topics {
        let topic = topic.trim().to_string();
        if !topic.is_empty() {
            summary.main_topics.insert(topic);
        }
    }
    summary.recent_context = raw.recent_context.trim().to_string();
    Ok(summary)
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    #[serde(default)]
    key_facts: IndexMap<String, String>,
    #[serde(default)]
    main_topics: Vec<String>,
    #[serde(default)]
    recent_context: String,
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Unknown error")]
    Unknown,
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
