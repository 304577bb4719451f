//! OpenAI Chat Completions client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ModelClient, ModelError};

const OPENAI_API_URL: &str = "https://api.openai.com";
const PROVIDER: &str = "openai";

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            base_url: OPENAI_API_URL.to_string(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.openai_api_key.as_deref()).with_default_model(&config.default_model)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    fn model_id<'a>(&'a self, hint: Option<&'a str>) -> &'a str {
        match hint {
            Some(m) if !m.is_empty() && m != "default" => m,
            _ => &self.default_model,
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn generate_text(&self, prompt: &str, model: Option<&str>) -> Result<String, ModelError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(ModelError::MissingCredentials { provider: PROVIDER })?;

        let model_id = self.model_id(model);
        let request = ChatRequest {
            model: model_id.to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        debug!("Calling OpenAI API: model={}, prompt_len={}", model_id, prompt.len());

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
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

        let result: ChatResponse = response.json().await?;
        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ModelError::EmptyResponse { provider: PROVIDER });
        }

        Ok(content)
    }

    fn provider(&self) -> &'static str {
        PROVIDER
    }
}
