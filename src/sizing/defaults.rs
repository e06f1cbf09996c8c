//! Static per-provider context size defaults

/// Learned sizes are never reduced below this floor
pub const CONTEXT_SIZE_FLOOR: usize = 4096;

/// Default for providers not in the table
pub const FALLBACK_CONTEXT_SIZE: usize = 131_072;

/// Static default context window per provider. Powers of two by convention;
/// the adaptive halving corrects any model that is actually smaller.
pub fn provider_default(provider: &str) -> usize {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => 262_144,
        "anthropic" => 262_144,
        "google" | "gemini" => 1_048_576,
        "mistral" => 131_072,
        "deepseek" => 131_072,
        "ollama" => 8_192,
        _ => FALLBACK_CONTEXT_SIZE,
    }
}

/// Deterministic store key for one provider/model pair
pub fn model_key(provider: &str, model: &str) -> String {
    format!("{}:{}", provider, model)
}
