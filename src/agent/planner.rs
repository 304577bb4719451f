//! Planning Stage
//!
//! Turns an intent (plus optional context) into an ordered [`Plan`]:
//! - [`Step`]: immutable unit of work, an action tag plus free-form params
//! - [`Plan`]: validated step list, order is execution order
//! - [`TemplatePlanner`]: fixed summary + search plan
//! - [`LlmPlanner`]: plan drafted by the model client
//!
//! Planning never executes anything; the only outside call is the planner's
//! own backend.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::{ModelClient, ModelError};

/// Auxiliary planning data (prior conversation, prior plan results)
pub type Context = HashMap<String, Value>;

/// Errors that prevent a plan from being produced
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("Intent must not be empty")]
    EmptyIntent,

    #[error("Step {index} is missing an id or action")]
    IncompleteStep { index: usize },

    #[error("Duplicate step id in plan: {0}")]
    DuplicateStepId(String),

    #[error("Planner backend failed: {0}")]
    Backend(#[from] ModelError),

    #[error("Planner returned an unreadable plan: {0}")]
    Parse(String),
}

/// A single unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    id: String,
    action: String,
    #[serde(default, alias = "outputKey", skip_serializing_if = "Option::is_none")]
    output_key: Option<String>,
    #[serde(flatten)]
    params: Map<String, Value>,
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

impl Step {
    /// Create a new step
    pub fn new(id: &str, action: &str) -> Self {
        Self {
            id: id.to_string(),
            action: action.to_string(),
            output_key: None,
            params: Map::new(),
        }
    }

    /// Add an action parameter
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Name the output slot downstream steps can reference
    pub fn with_output_key(mut self, key: &str) -> Self {
        self.output_key = Some(key.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Params as a JSON object, the shape tools are invoked with
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Copy of this step with `{{key}}` placeholders filled from `outputs`.
    ///
    /// A parameter that is exactly one placeholder takes the referenced value
    /// as-is; placeholders inside longer text are spliced in as text.
    /// Unknown keys are left untouched.
    pub fn resolve(&self, outputs: &HashMap<String, Value>) -> Step {
        if outputs.is_empty() {
            return self.clone();
        }

        let params = self
            .params
            .iter()
            .map(|(name, value)| (name.clone(), resolve_value(value, outputs)))
            .collect();

        Step {
            id: self.id.clone(),
            action: self.action.clone(),
            output_key: self.output_key.clone(),
            params,
        }
    }

    /// Output keys this step reads through placeholders
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for value in self.params.values() {
            collect_references(value, &mut refs);
        }
        refs
    }
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(text) => resolve_text(text, outputs),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_text(text: &str, outputs: &HashMap<String, Value>) -> Value {
    if let Some(caps) = PLACEHOLDER.captures(text) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
            if let Some(found) = outputs.get(&caps[1]) {
                return found.clone();
            }
        }
    }

    let replaced = PLACEHOLDER.replace_all(text, |caps: &regex::Captures| {
        match outputs.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn collect_references(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for caps in PLACEHOLDER.captures_iter(text) {
                refs.push(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, refs)),
        _ => {}
    }
}

/// An ordered, validated sequence of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan ID
    pub id: String,
    /// Intent this plan was derived from
    pub intent: String,
    steps: Vec<Step>,
    /// Creation timestamp
    pub created_at: i64,
}

impl Plan {
    /// Create a plan, rejecting empty intents, incomplete steps and duplicate ids
    pub fn new(intent: &str, steps: Vec<Step>) -> Result<Self, PlanningError> {
        if intent.trim().is_empty() {
            return Err(PlanningError::EmptyIntent);
        }

        let mut seen = HashSet::new();
        for (index, step) in steps.iter().enumerate() {
            if step.id.trim().is_empty() || step.action.trim().is_empty() {
                return Err(PlanningError::IncompleteStep { index });
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PlanningError::DuplicateStepId(step.id.clone()));
            }
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            intent: intent.to_string(),
            steps,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Get step by id
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Placeholders that no earlier step (or `known` context key) produces
    pub fn unresolved_references(&self, known: &HashSet<String>) -> Vec<(String, String)> {
        let mut produced: HashSet<String> = known.clone();
        let mut missing = Vec::new();

        for step in &self.steps {
            for reference in step.references() {
                if !produced.contains(&reference) {
                    missing.push((step.id.clone(), reference));
                }
            }
            if let Some(key) = &step.output_key {
                produced.insert(key.clone());
            }
        }

        missing
    }
}

/// Planning stage contract
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, intent: &str, context: Option<&Context>) -> Result<Plan, PlanningError>;
}

/// Fixed two-step plan: summarize the intent, then search for it
#[derive(Debug, Clone, Default)]
pub struct TemplatePlanner;

#[async_trait]
impl Planner for TemplatePlanner {
    async fn create_plan(&self, intent: &str, _context: Option<&Context>) -> Result<Plan, PlanningError> {
        if intent.trim().is_empty() {
            return Err(PlanningError::EmptyIntent);
        }

        info!("Generating template plan for intent: '{}'", intent);

        Plan::new(
            intent,
            vec![
                Step::new("step-1", "call_llm")
                    .with_param(
                        "prompt",
                        format!("Analyze the following user intent and summarize it: '{}'", intent),
                    )
                    .with_output_key("summary"),
                Step::new("step-2", "search_web")
                    .with_param("query", format!("Find information about '{}'", intent))
                    .with_output_key("search_results"),
            ],
        )
    }
}

/// Planner configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Maximum steps per plan
    pub max_steps: usize,
    /// Model hint for planning calls
    pub model: Option<String>,
    /// Actions the executor can dispatch to
    pub actions: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            model: None,
            actions: vec![
                "call_llm".to_string(),
                "search_web".to_string(),
                "noop".to_string(),
            ],
        }
    }
}

/// Planner that asks the model client to decompose the intent
pub struct LlmPlanner {
    model: Arc<dyn ModelClient>,
    config: PlannerConfig,
}

impl LlmPlanner {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self::with_config(model, PlannerConfig::default())
    }

    pub fn with_config(model: Arc<dyn ModelClient>, config: PlannerConfig) -> Self {
        Self { model, config }
    }

    fn build_prompt(&self, intent: &str, context: Option<&Context>) -> String {
        let context_block = match context {
            Some(ctx) if !ctx.is_empty() => {
                let mut keys: Vec<_> = ctx.keys().collect();
                keys.sort();
                let lines: Vec<String> = keys
                    .into_iter()
                    .map(|k| format!("- {}: {}", k, truncate(&ctx[k].to_string(), 300)))
                    .collect();
                format!("\nContext (reference values as {{{{key}}}}):\n{}\n", lines.join("\n"))
            }
            _ => String::new(),
        };

        format!(
            r#"Create an execution plan for this intent. Break it into clear, actionable steps.

Intent: {}
{}
Available actions: {}

Return a JSON array of steps:
[{{"id": "step-1", "action": "call_llm", "prompt": "...", "output_key": "summary"}}, ...]

Later steps may use an earlier output_key as {{{{output_key}}}} inside their parameters.
Keep steps atomic. Maximum {} steps.

JSON only:"#,
            intent,
            context_block,
            self.config.actions.join(", "),
            self.config.max_steps
        )
    }

    /// Parse LLM response into a Plan
    fn parse_plan(&self, intent: &str, response: &str) -> Result<Plan, PlanningError> {
        let raw = extract_step_array(response)
            .ok_or_else(|| PlanningError::Parse("no JSON array of steps in planner response".to_string()))?;

        if raw.len() > self.config.max_steps {
            warn!(
                "Planner returned {} steps, keeping the first {}",
                raw.len(),
                self.config.max_steps
            );
        }

        let mut steps = Vec::new();
        for (i, mut fields) in raw.into_iter().take(self.config.max_steps).enumerate() {
            let id = match fields.remove("id") {
                Some(Value::String(id)) => Value::String(id),
                Some(Value::Number(n)) => Value::String(n.to_string()),
                Some(Value::Bool(b)) => Value::String(b.to_string()),
                Some(Value::Null) | None => Value::String(format!("step-{}", i + 1)),
                Some(other) => other,
            };
            fields.insert("id".to_string(), id);
            let step: Step = serde_json::from_value(Value::Object(fields))
                .map_err(|e| PlanningError::Parse(format!("step {}: {}", i + 1, e)))?;
            steps.push(step);
        }

        Plan::new(intent, steps)
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn create_plan(&self, intent: &str, context: Option<&Context>) -> Result<Plan, PlanningError> {
        if intent.trim().is_empty() {
            return Err(PlanningError::EmptyIntent);
        }

        let prompt = self.build_prompt(intent, context);
        let response = self
            .model
            .generate_text(&prompt, self.config.model.as_deref())
            .await?;

        let plan = self.parse_plan(intent, &response)?;
        info!("LLM planner produced {} steps for plan {}", plan.len(), plan.id);
        Ok(plan)
    }
}

/// First JSON array of step objects in `s`.
///
/// Bracketed prose (`see [1]`) is skipped; an empty array is only returned
/// when no non-empty candidate parses.
fn extract_step_array(s: &str) -> Option<Vec<Map<String, Value>>> {
    let mut empty = None;

    for (start, _) in s.match_indices('[') {
        let Some(candidate) = balanced_array_at(s, start) else {
            continue;
        };
        if let Ok(steps) = serde_json::from_str::<Vec<Map<String, Value>>>(candidate) {
            if !steps.is_empty() {
                return Some(steps);
            }
            empty.get_or_insert(steps);
        }
    }

    empty
}

/// The balanced `[...]` starting at byte `start`, ignoring brackets inside strings
fn balanced_array_at(s: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Truncate string to at most `max` bytes on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
