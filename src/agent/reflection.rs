//! Post-run Reflection
//!
//! Turns a finished plan and its step records into an [`Insight`]:
//! - Outcome counts (completed, cached, denied, failed, skipped)
//! - Heuristic flags on suspicious text outputs (refusals, truncation, errors)
//! - Exact verification of simple arithmetic claims (`12 * 3 = 36`)
//!
//! Reflection never fails; a reflector that cannot say anything useful
//! still returns an insight with the counts filled in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::orchestrator::{StepOutcome, StepRecord};
use super::planner::Plan;

static ARITHMETIC_CLAIM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(-?\d+)\s*([+\-*/x×])\s*(-?\d+)\s*=\s*(-?\d+)").expect("claim pattern is valid")
});

/// A match of `text[start..end]` is a whole claim only when it is not cut
/// out of a longer number or a decimal (`1.5 + 2 = 3.5`)
fn is_standalone(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    if before.is_some_and(|c| c.is_ascii_digit() || c == '.') {
        return false;
    }
    let mut after = text[end..].chars();
    match after.next() {
        Some(c) if c.is_ascii_digit() => false,
        Some('.') => !after.next().is_some_and(|c| c.is_ascii_digit()),
        _ => true,
    }
}

/// Suspicious output from one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFlag {
    pub step_id: String,
    pub reason: String,
}

/// An arithmetic statement found in a step output, checked exactly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedClaim {
    pub step_id: String,
    pub claim: String,
    pub correct: bool,
    /// The true result when the claim is wrong and the operation is defined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

/// Structured summary of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub plan_id: String,
    pub intent: String,
    pub total_steps: usize,
    pub completed: usize,
    /// Completed steps served from cache
    pub cached: usize,
    pub denied: usize,
    pub failed: usize,
    /// Plan steps with no record (run aborted before reaching them)
    pub skipped: usize,
    pub flags: Vec<OutputFlag>,
    pub claims: Vec<VerifiedClaim>,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    /// Every plan step completed and nothing was flagged
    pub fn is_clean(&self) -> bool {
        self.completed == self.total_steps
            && self.flags.is_empty()
            && self.claims.iter().all(|c| c.correct)
    }

    /// Compact form handed to the next planning round
    pub fn to_context_value(&self) -> Value {
        serde_json::json!({
            "completed": self.completed,
            "total_steps": self.total_steps,
            "notes": self.notes,
        })
    }
}

/// Consumes a finished plan and its records
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, plan: &Plan, results: &[StepRecord]) -> Insight;
}

/// Configuration for [`OutcomeReflector`]
#[derive(Debug, Clone)]
pub struct ReflectionConfig {
    /// Text outputs shorter than this are flagged
    pub min_output_len: usize,
    pub verify_claims: bool,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            min_output_len: 10,
            verify_claims: true,
        }
    }
}

/// Rule-based reflector, no model calls
#[derive(Debug, Clone, Default)]
pub struct OutcomeReflector {
    config: ReflectionConfig,
}

impl OutcomeReflector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ReflectionConfig) -> Self {
        Self { config }
    }

    /// First heuristic issue found in a text output, if any
    pub fn quick_check(&self, response: &str) -> Option<&'static str> {
        let trimmed = response.trim();
        if trimmed.len() < self.config.min_output_len {
            Some("output is suspiciously short")
        } else if trimmed.starts_with("I'm sorry") || trimmed.contains("I cannot") {
            Some("output looks like a refusal")
        } else if trimmed.contains("I don't have") {
            Some("output reports missing information")
        } else if trimmed.matches("...").count() > 3 || trimmed.ends_with("...") {
            Some("output looks truncated")
        } else if trimmed.to_lowercase().contains("error") {
            Some("output mentions an error")
        } else {
            None
        }
    }

    /// Find and check `a op b = c` statements in `text`
    pub fn verify_claims(step_id: &str, text: &str) -> Vec<VerifiedClaim> {
        ARITHMETIC_CLAIM
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                if !is_standalone(text, whole.start(), whole.end()) {
                    debug!("Skipping partial numeric claim '{}'", whole.as_str());
                    return None;
                }
                let a: i128 = caps[1].parse().ok()?;
                let b: i128 = caps[3].parse().ok()?;
                let claimed: i128 = caps[4].parse().ok()?;
                let actual = match &caps[2] {
                    "+" => a.checked_add(b),
                    "-" => a.checked_sub(b),
                    "*" | "x" | "×" => a.checked_mul(b),
                    "/" => {
                        if b == 0 {
                            None
                        } else if a % b == 0 {
                            Some(a / b)
                        } else {
                            // non-integral quotient can never equal an integer claim
                            return Some(VerifiedClaim {
                                step_id: step_id.to_string(),
                                claim: caps[0].to_string(),
                                correct: false,
                                expected: Some(format!("{}", a as f64 / b as f64)),
                            });
                        }
                    }
                    _ => None,
                };
                Some(VerifiedClaim {
                    step_id: step_id.to_string(),
                    claim: caps[0].to_string(),
                    correct: actual == Some(claimed),
                    expected: actual.filter(|v| *v != claimed).map(|v| v.to_string()),
                })
            })
            .collect()
    }

    fn inspect_value(&self, step_id: &str, value: &Value, flags: &mut Vec<OutputFlag>, claims: &mut Vec<VerifiedClaim>) {
        match value {
            Value::String(text) => {
                if let Some(reason) = self.quick_check(text) {
                    flags.push(OutputFlag {
                        step_id: step_id.to_string(),
                        reason: reason.to_string(),
                    });
                }
                if self.config.verify_claims {
                    claims.extend(Self::verify_claims(step_id, text));
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Value::String(text) = item {
                        if self.config.verify_claims {
                            claims.extend(Self::verify_claims(step_id, text));
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Reflector for OutcomeReflector {
    async fn reflect(&self, plan: &Plan, results: &[StepRecord]) -> Insight {
        let mut completed = 0;
        let mut cached = 0;
        let mut denied = 0;
        let mut failed = 0;
        let mut flags = Vec::new();
        let mut claims = Vec::new();
        let mut notes = Vec::new();

        for record in results {
            match &record.outcome {
                StepOutcome::Completed {
                    value, cached: hit, ..
                } => {
                    completed += 1;
                    if *hit {
                        cached += 1;
                    }
                    self.inspect_value(&record.step_id, value, &mut flags, &mut claims);
                }
                StepOutcome::PolicyDenied { reason } => {
                    denied += 1;
                    notes.push(format!("step {} ({}) was denied: {}", record.step_id, record.action, reason));
                }
                StepOutcome::Failed { error } => {
                    failed += 1;
                    notes.push(format!("step {} ({}) failed: {}", record.step_id, record.action, error));
                }
            }
        }

        let skipped = plan
            .steps()
            .iter()
            .filter(|step| !results.iter().any(|r| r.step_id == step.id()))
            .count();
        if skipped > 0 {
            notes.push(format!("{} step(s) never ran", skipped));
        }

        for claim in claims.iter().filter(|c| !c.correct) {
            notes.push(match &claim.expected {
                Some(expected) => format!(
                    "step {} claims '{}' but the result is {}",
                    claim.step_id, claim.claim, expected
                ),
                None => format!("step {} claims '{}' which is undefined", claim.step_id, claim.claim),
            });
        }

        debug!("Reflection flags: {:?}", flags);

        let insight = Insight {
            plan_id: plan.id.clone(),
            intent: plan.intent.clone(),
            total_steps: plan.len(),
            completed,
            cached,
            denied,
            failed,
            skipped,
            flags,
            claims,
            notes,
            created_at: Utc::now(),
        };

        info!(
            "Reflection complete: {}/{} completed ({} cached, {} denied, {} failed)",
            insight.completed, insight.total_steps, insight.cached, insight.denied, insight.failed
        );

        insight
    }
}
