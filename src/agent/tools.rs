//! Action Dispatch Table
//!
//! Each step `action` tag maps to one registered [`Tool`]:
//! - Tool registration with JSON schemas
//! - Parameter validation before invoke
//! - Built-in `call_llm`, `search_web` and `noop`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

/// JSON Schema for tool parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Action tag (snake_case)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: Value,
    /// Required parameter names
    pub required: Vec<String>,
}

impl ToolSchema {
    /// Create a new tool schema
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            required: vec![],
        }
    }

    fn with_param(mut self, name: &str, kind: &str, description: &str, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = serde_json::json!({
                "type": kind,
                "description": description
            });
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Add a string parameter
    pub fn with_string_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "string", description, required)
    }

    /// Add an integer parameter
    pub fn with_int_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "integer", description, required)
    }

    /// Add a number parameter
    pub fn with_number_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, "number", description, required)
    }

    /// Validate parameters against schema
    pub fn validate(&self, params: &Value) -> Result<()> {
        for req in &self.required {
            if params.get(req).is_none() {
                return Err(anyhow!("Missing required parameter: {}", req));
            }
        }

        if let Some(obj) = self.parameters.get("properties").and_then(|p| p.as_object()) {
            for (name, schema) in obj {
                if let Some(value) = params.get(name) {
                    let expected_type = schema.get("type").and_then(|t| t.as_str());
                    let valid = match expected_type {
                        Some("string") => value.is_string(),
                        Some("integer") => value.is_i64() || value.is_u64(),
                        Some("number") => value.is_number(),
                        Some("boolean") => value.is_boolean(),
                        Some("array") => value.is_array(),
                        Some("object") => value.is_object(),
                        _ => true,
                    };
                    if !valid {
                        return Err(anyhow!(
                            "Parameter '{}' has wrong type, expected {}",
                            name,
                            expected_type.unwrap_or("unknown")
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Type alias for tool handler function
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A registered tool with schema and handler
#[derive(Clone)]
pub struct Tool {
    pub schema: ToolSchema,
    handler: ToolHandler,
}

impl Tool {
    /// Create a new tool
    pub fn new<F, Fut>(schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            schema,
            handler: Arc::new(move |params| Box::pin(handler(params))),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Validate parameters, then run the handler
    pub async fn invoke(&self, params: Value) -> Result<Value> {
        self.schema.validate(&params)?;
        (self.handler)(params).await
    }
}

/// Tool registry keyed by action tag
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool; a tool already registered under the same tag is replaced
    pub fn register(&mut self, tool: Tool) {
        info!("Registered tool: {}", tool.schema.name);
        self.tools.insert(tool.schema.name.clone(), tool);
    }

    /// Registry with `call_llm`, `search_web` and `noop`
    pub fn with_builtins(model: Arc<dyn crate::llm::ModelClient>, search_url: Option<String>) -> Self {
        Self::new()
            .with(builtin::call_llm_tool(model))
            .with(builtin::search_web_tool(search_url))
            .with(builtin::noop_tool())
    }

    /// Builder-style register
    pub fn with(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by action tag
    pub fn get(&self, action: &str) -> Option<&Tool> {
        self.tools.get(action)
    }

    /// List all action tags, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all tool schemas
    pub fn schemas(&self) -> Vec<&ToolSchema> {
        self.tools.values().map(|t| &t.schema).collect()
    }
}

/// Built-in tools for the default action set
pub mod builtin {
    use super::*;
    use crate::llm::ModelClient;
    use reqwest::Client;

    /// `call_llm`: run `prompt` against the model client
    pub fn call_llm_tool(model: Arc<dyn ModelClient>) -> Tool {
        let schema = ToolSchema::new("call_llm", "Generate text with the configured model")
            .with_string_param("prompt", "Prompt to send", true)
            .with_string_param("model", "Model hint (haiku, sonnet, opus, ...)", false);

        Tool::new(schema, move |params| {
            let model = Arc::clone(&model);
            async move {
                let prompt = params.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
                let hint = params.get("model").and_then(|v| v.as_str());
                let text = model.generate_text(prompt, hint).await?;
                Ok(Value::String(text))
            }
        })
    }

    /// `search_web`: query a JSON search endpoint (SearxNG-compatible `?q=&format=json`)
    pub fn search_web_tool(endpoint: Option<String>) -> Tool {
        let schema = ToolSchema::new("search_web", "Search the web for information")
            .with_string_param("query", "Search query", true)
            .with_int_param("max_results", "Maximum number of results", false);

        let client = Client::new();

        Tool::new(schema, move |params| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            async move {
                let endpoint = endpoint.ok_or_else(|| anyhow!("search endpoint not configured"))?;
                let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
                let max_results = params
                    .get("max_results")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(5) as usize;

                let response = client
                    .get(&endpoint)
                    .query(&[("q", query), ("format", "json")])
                    .send()
                    .await?
                    .error_for_status()?;

                let body: Value = response.json().await?;
                Ok(trim_results(body, max_results))
            }
        })
    }

    /// `noop`: acknowledges without doing any work
    pub fn noop_tool() -> Tool {
        let schema = ToolSchema::new("noop", "Do nothing and acknowledge");
        Tool::new(schema, |_params| async move {
            Ok(serde_json::json!({ "status": "ok" }))
        })
    }

    /// Keep at most `max` entries of a `results` array
    fn trim_results(mut body: Value, max: usize) -> Value {
        if let Some(results) = body.get_mut("results").and_then(|r| r.as_array_mut()) {
            results.truncate(max);
        }
        body
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_trim_results() {
            let body = serde_json::json!({"results": [1, 2, 3, 4], "query": "q"});
            let trimmed = trim_results(body, 2);
            assert_eq!(trimmed["results"], serde_json::json!([1, 2]));
            assert_eq!(trimmed["query"], "q");
        }
    }
}
