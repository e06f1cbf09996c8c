//! Summarization batch selection and the extractive fallback
//!
//! Pure helpers used by the buffer's background summarization task. The
//! fallback path must never fail: when the AI summarizer errors or times
//! out, the selected messages are condensed into truncated excerpts so the
//! buffer can still shrink without losing the batch entirely.

use super::models::Message;

/// How many of the oldest eligible messages one summarization pass consumes.
/// Zero when nothing is eligible, otherwise at least one.
pub(crate) fn summary_batch_size(eligible: usize, fraction: f64) -> usize {
    if eligible == 0 {
        return 0;
    }
    ((eligible as f64 * fraction).ceil() as usize).clamp(1, eligible)
}

/// Render a batch as plain conversational text for the summarizer call
pub(crate) fn render_conversation(messages: &[Message]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content.trim()))
        .collect();
    lines.join("\n")
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Build the extractive bullet lines for a failed summarization: every
/// selected message when the batch is small (≤6), otherwise the first two
/// and last two as representatives.
pub(crate) fn basic_fallback_bullets(selected: &[Message], excerpt_chars: usize) -> String {
    let representatives: Vec<&Message> = if selected.len() <= 6 {
        selected.iter().collect()
    } else {
        selected
            .iter()
            .take(2)
            .chain(selected.iter().skip(selected.len() - 2))
            .collect()
    };

    let lines: Vec<String> = representatives
        .iter()
        .map(|m| format!("- {}: {}", m.role, excerpt(&m.content, excerpt_chars)))
        .collect();
    lines.join("\n")
}

/// Append new bullet lines to an existing basic summary, dropping the oldest
/// content once the cap is exceeded.
pub(crate) fn append_capped(existing: Option<&str>, addition: &str, cap: usize) -> String {
    let combined = match existing {
        Some(prior) if !prior.is_empty() => format!("{}\n{}", prior, addition),
        _ => addition.to_string(),
    };

    let total = combined.chars().count();
    if total <= cap {
        return combined;
    }
    let tail: String = combined.chars().skip(total - cap).collect();
    format!("...{}", tail.trim_start())
}
