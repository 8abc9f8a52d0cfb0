//! Concrete provider adapters.
//!
//! Each backend family implements [`crate::llm::Provider`] once; the
//! orchestration loop is oblivious to which one it drives. Model/config
//! selects the backend via [`for_model`].

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;

use crate::llm::Provider;
use crate::types::ModelConfig;
use std::sync::Arc;

/// Build the adapter named by a model config.
///
/// # Errors
/// Returns an error for an unknown provider name.
pub fn for_model(config: &ModelConfig, api_key: String) -> anyhow::Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            api_key,
            config.model.clone(),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(api_key, config.model.clone()))),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}
