//! Learned per-model context sizes

pub mod defaults;
pub mod store;

pub use defaults::{model_key, provider_default, CONTEXT_SIZE_FLOOR, FALLBACK_CONTEXT_SIZE};
pub use store::{ContextSizeStore, SizingConfig};
