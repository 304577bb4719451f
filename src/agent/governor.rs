//! Compliance Gate
//!
//! Every step passes through a [`Governor`] before it reaches the executor.
//! A denial is an outcome, not an error: the orchestrator records it and
//! moves on to the next step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::planner::Step;

/// Verdict for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ComplianceDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Read-only policy check run before each step
#[async_trait]
pub trait Governor: Send + Sync {
    async fn check_compliance(&self, step: &Step) -> ComplianceDecision;
}

/// Default policy: every step is allowed
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Governor for AllowAll {
    async fn check_compliance(&self, _step: &Step) -> ComplianceDecision {
        ComplianceDecision::allow()
    }
}

/// Errors loading a policy document
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    #[error("Failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid policy TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Policy document
///
/// ```toml
/// enabled = true
/// allowed_actions = ["call_llm", "search_web"]
/// blocked_terms = ["password", "rm -rf"]
/// max_cost_per_step = 0.50
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Action tags that may run; empty allows any action
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    /// Case-insensitive substrings forbidden in string parameters
    #[serde(default)]
    pub blocked_terms: Vec<String>,
    /// Upper bound on a step's `estimated_cost` parameter
    #[serde(default)]
    pub max_cost_per_step: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_actions: vec![],
            blocked_terms: vec![],
            max_cost_per_step: None,
        }
    }
}

impl PolicyConfig {
    pub fn from_toml(text: &str) -> Result<Self, PolicyLoadError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

/// Rule-based governor driven by a [`PolicyConfig`]
#[derive(Debug, Clone)]
pub struct PolicyGovernor {
    policy: PolicyConfig,
    blocked_lower: Vec<String>,
}

impl PolicyGovernor {
    pub fn new(policy: PolicyConfig) -> Self {
        let blocked_lower = policy
            .blocked_terms
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            policy,
            blocked_lower,
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    fn find_blocked_term(&self, value: &Value) -> Option<&str> {
        match value {
            Value::String(text) => {
                let lower = text.to_lowercase();
                self.blocked_lower
                    .iter()
                    .find(|term| lower.contains(term.as_str()))
                    .map(|t| t.as_str())
            }
            Value::Array(items) => items.iter().find_map(|v| self.find_blocked_term(v)),
            Value::Object(map) => map.values().find_map(|v| self.find_blocked_term(v)),
            _ => None,
        }
    }

    fn evaluate(&self, step: &Step) -> ComplianceDecision {
        if !self.policy.enabled {
            return ComplianceDecision::allow();
        }

        if !self.policy.allowed_actions.is_empty()
            && !self.policy.allowed_actions.iter().any(|a| a == step.action())
        {
            return ComplianceDecision::deny(format!("action '{}' is not allowed", step.action()));
        }

        if let Some(max) = self.policy.max_cost_per_step {
            if let Some(cost) = step.param("estimated_cost").and_then(Value::as_f64) {
                if cost > max {
                    return ComplianceDecision::deny(format!(
                        "estimated cost {:.2} exceeds limit {:.2}",
                        cost, max
                    ));
                }
            }
        }

        for value in step.params().values() {
            if let Some(term) = self.find_blocked_term(value) {
                return ComplianceDecision::deny(format!("parameters contain blocked term '{}'", term));
            }
        }

        ComplianceDecision::allow()
    }
}

#[async_trait]
impl Governor for PolicyGovernor {
    async fn check_compliance(&self, step: &Step) -> ComplianceDecision {
        let decision = self.evaluate(step);
        debug!(
            "Policy check for step {}: allowed={} reason={:?}",
            step.id(),
            decision.allowed,
            decision.reason
        );
        decision
    }
}
