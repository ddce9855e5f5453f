//! LLM integration for chatdesk.
//!
//! Replies are generated through the [`LlmProvider`] trait. The shipped
//! backend speaks the OpenAI chat-completions protocol, which also covers
//! compatible gateways via `CHATDESK_LLM_BASE_URL`.

mod costs;
mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::GeneratorConfig;
use crate::error::ConfigError;

/// Create the reply generator from configuration.
pub fn create_provider(config: &GeneratorConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;
    tracing::info!("Using OpenAI-compatible backend (model: {})", config.model);
    Ok(Arc::new(OpenAiProvider::new(
        api_key,
        &config.base_url,
        &config.model,
    )))
}
