//! Data models for conversation memory

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolResult,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::ToolResult => write!(f, "tool_result"),
        }
    }
}

/// A single conversation message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(MessageRole::ToolResult, content)
    }

    /// True when the content is empty or whitespace-only
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Structured summary produced by the AI-assisted summarizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredSummary {
    /// Durable facts extracted from the conversation, keyed by subject
    pub key_facts: IndexMap<String, String>,
    /// Topics discussed, deduplicated, insertion order preserved
    pub main_topics: IndexSet<String>,
    /// Short prose recap of the most recent summarized turns
    pub recent_context: String,
}

impl StructuredSummary {
    pub fn is_empty(&self) -> bool {
        self.key_facts.is_empty() && self.main_topics.is_empty() && self.recent_context.is_empty()
    }

    /// Merge a newer summary into this one.
    ///
    /// Key facts: union, newer value wins on key collision. Topics: deduped
    /// append. Recent context: newest always replaces.
    pub fn merge(&mut self, newer: StructuredSummary) {
        for (key, value) in newer.key_facts {
            self.key_facts.insert(key, value);
        }
        for topic in newer.main_topics {
            self.main_topics.insert(topic);
        }
        if !newer.recent_context.is_empty() {
            self.recent_context = newer.recent_context;
        }
    }

    /// Render as the text of the synthetic system message prepended to reads
    pub fn render(&self) -> String {
        let mut out = String::from("Summary of the conversation so far:\n");
        if !self.key_facts.is_empty() {
            out.push_str("Key facts:\n");
            for (key, value) in &self.key_facts {
                out.push_str(&format!("- {}: {}\n", key, value));
            }
        }
        if !self.main_topics.is_empty() {
            let topics: Vec<&str> = self.main_topics.iter().map(String::as_str).collect();
            out.push_str(&format!("Topics discussed: {}\n", topics.join(", ")));
        }
        if !self.recent_context.is_empty() {
            out.push_str(&format!("Recent context: {}\n", self.recent_context));
        }
        out.trim_end().to_string()
    }
}

/// Full persisted state of one session's conversation buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub structured_summary: Option<StructuredSummary>,
    pub basic_summary: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl MemorySnapshot {
    pub fn new(
        session_id: impl Into<String>,
        messages: Vec<Message>,
        structured_summary: Option<StructuredSummary>,
        basic_summary: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            structured_summary,
            basic_summary,
            last_updated: Utc::now(),
        }
    }
}
