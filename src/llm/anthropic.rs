//! Claude API Client
//!
//! Anthropic Messages API client used by `call_llm` steps and the LLM planner.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ModelClient, ModelError};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

/// Claude API client
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    max_tokens: usize,
}

/// Message in conversation
#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// API request
#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<Message>,
}

/// API response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

impl AnthropicClient {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            base_url: ANTHROPIC_API_URL.to_string(),
            default_model: "sonnet".to_string(),
            max_tokens: 4096,
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.anthropic_api_key.as_deref()).with_default_model(&config.default_model)
    }

    /// Point at a different API host (proxies, tests)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get model ID from hint
    fn model_id(model: &str) -> String {
        match model.to_lowercase().as_str() {
            "haiku" => "claude-3-5-haiku-20241022".to_string(),
            "opus" => "claude-3-opus-20240229".to_string(),
            "sonnet" | "default" | "" => "claude-sonnet-4-20250514".to_string(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn generate_text(&self, prompt: &str, model: Option<&str>) -> Result<String, ModelError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(ModelError::MissingCredentials { provider: PROVIDER })?;

        let model_id = Self::model_id(model.unwrap_or(&self.default_model));

        let request = MessageRequest {
            model: model_id.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Calling Claude API: model={}, prompt_len={}", model_id, prompt.len());

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(ModelError::Api {
                provider: PROVIDER,
                status,
                body,
            });
        }

        let result: MessageResponse = response.json().await?;

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(usage) = &result.usage {
            info!(
                "Claude response: model={}, in={}, out={}",
                model_id, usage.input_tokens, usage.output_tokens
            );
        }

        if content.trim().is_empty() {
            return Err(ModelError::EmptyResponse { provider: PROVIDER });
        }

        Ok(content)
    }

    fn provider(&self) -> &'static str {
        PROVIDER
    }
}
