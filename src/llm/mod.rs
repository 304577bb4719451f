//! Model Invocation Clients
//!
//! One narrow contract, [`ModelClient::generate_text`], with a variant per
//! provider. Failures are always a [`ModelError`]; an empty completion is
//! reported as [`ModelError::EmptyResponse`] rather than an empty string.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::config::{Config, Provider};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// Errors from a model provider
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{provider} API key not set - model calls unavailable")]
    MissingCredentials { provider: &'static str },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an empty completion")]
    EmptyResponse { provider: &'static str },
}

/// Text generation against a model provider
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run `prompt`; `model` is a provider-specific hint, `None` uses the default
    async fn generate_text(&self, prompt: &str, model: Option<&str>) -> Result<String, ModelError>;

    /// Provider name for log events
    fn provider(&self) -> &'static str;
}

/// Credential-free model that answers deterministically from the prompt.
///
/// Lets the pipeline run end-to-end without network access.
#[derive(Debug, Clone, Default)]
pub struct OfflineModel;

#[async_trait]
impl ModelClient for OfflineModel {
    async fn generate_text(&self, prompt: &str, model: Option<&str>) -> Result<String, ModelError> {
        let preview: String = prompt.chars().take(80).collect();
        Ok(format!(
            "[offline:{}] {}",
            model.unwrap_or("default"),
            preview.trim()
        ))
    }

    fn provider(&self) -> &'static str {
        "offline"
    }
}

/// Build the configured model client.
///
/// A missing credential only warns: actions that never call the model keep working.
pub fn from_config(config: &Config) -> Arc<dyn ModelClient> {
    match config.provider {
        Provider::Anthropic => {
            if config.anthropic_api_key.is_none() {
                warn!("ANTHROPIC_API_KEY not set - call_llm steps will fail");
            }
            Arc::new(AnthropicClient::from_config(config))
        }
        Provider::OpenAi => {
            if config.openai_api_key.is_none() {
                warn!("OPENAI_API_KEY not set - call_llm steps will fail");
            }
            Arc::new(OpenAiClient::from_config(config))
        }
        Provider::Offline => Arc::new(OfflineModel),
    }
}
