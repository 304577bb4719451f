//! Pipeline Orchestrator
//!
//! Drives one run through its states:
//!
//! ```text
//! Planning -> Running(0..n) -> Reflecting -> Done
//!                 \-> Aborted (fatal step failure, abort mode)
//! ```
//!
//! Steps run strictly in plan order so a step can read an earlier step's
//! `output_key` through `{{key}}` placeholders. Independent runs may share
//! one cache concurrently.

use anyhow::{Context as _, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::executor::{CacheAsideExecutor, Executor, ExecutorConfig, KeyStrategy};
use super::governor::{AllowAll, Governor, PolicyConfig, PolicyGovernor};
use super::planner::{Context, LlmPlanner, Plan, Planner, PlannerConfig, PlanningError, TemplatePlanner};
use super::reflection::{Insight, OutcomeReflector, Reflector};
use super::tools::ToolRegistry;
use crate::cache::{Cache, InMemoryCache, RedisCache};
use crate::config::{CacheBackend, Config, PlannerKind};

/// Context key under which the previous run's insight is handed to the planner
pub const LAST_INSIGHT_KEY: &str = "last_insight";

/// What to do when a step fails to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Record the failure and run the remaining steps
    Continue,
    /// Stop at the first failure; the report carries the partial results
    Abort,
}

/// Run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planning,
    Running(usize),
    Reflecting,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Running(index) => write!(f, "running({})", index),
            Self::Reflecting => write!(f, "reflecting"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Outcome of one plan step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed {
        value: Value,
        cached: bool,
        #[serde(rename = "duration_ms", serialize_with = "as_millis")]
        duration: Duration,
    },
    PolicyDenied {
        reason: String,
    },
    Failed {
        error: String,
    },
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// One entry per step reached, in plan order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub action: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Result of [`Orchestrator::run`]
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: Plan,
    pub results: Vec<StepRecord>,
    /// `None` when no reflector is configured
    pub insight: Option<Insight>,
    pub aborted: bool,
    pub state: RunState,
}

impl RunReport {
    pub fn get(&self, step_id: &str) -> Option<&StepRecord> {
        self.results.iter().find(|r| r.step_id == step_id)
    }
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub failure_mode: FailureMode,
    pub carry_insights: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Continue,
            carry_insights: false,
        }
    }
}

/// Composes planner, governor, executor, cache and reflector
pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    governor: Arc<dyn Governor>,
    executor: Arc<dyn Executor>,
    cache: Arc<dyn Cache>,
    reflector: Option<Arc<dyn Reflector>>,
    config: OrchestratorConfig,
    last_insight: RwLock<Option<Insight>>,
}

impl Orchestrator {
    /// Orchestrator with an allow-all governor and no reflector
    pub fn new(planner: Arc<dyn Planner>, executor: Arc<dyn Executor>, cache: Arc<dyn Cache>) -> Self {
        Self {
            planner,
            governor: Arc::new(AllowAll),
            executor,
            cache,
            reflector: None,
            config: OrchestratorConfig::default(),
            last_insight: RwLock::new(None),
        }
    }

    pub fn with_governor(mut self, governor: Arc<dyn Governor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire every stage from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let model = crate::llm::from_config(config);

        let planner: Arc<dyn Planner> = match config.planner {
            PlannerKind::Template => Arc::new(TemplatePlanner),
            PlannerKind::Llm => Arc::new(LlmPlanner::with_config(
                model.clone(),
                PlannerConfig {
                    max_steps: config.max_steps,
                    model: Some(config.default_model.clone()),
                    ..Default::default()
                },
            )),
        };

        let cache: Arc<dyn Cache> = match (config.cache_backend, config.cache_enabled) {
            (CacheBackend::Redis, true) => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("REDIS_URL must be set for the redis cache backend")?;
                Arc::new(
                    RedisCache::connect(url, "agentic")
                        .await
                        .context("Failed to connect to redis")?,
                )
            }
            (_, enabled) => Arc::new(InMemoryCache::with_capacity(config.cache_max_entries, enabled)),
        };

        let governor: Arc<dyn Governor> = match &config.policy_path {
            Some(path) => {
                let policy = PolicyConfig::load(path)
                    .with_context(|| format!("Failed to load policy from {}", path.display()))?;
                info!("Loaded policy from {}", path.display());
                Arc::new(PolicyGovernor::new(policy))
            }
            None => Arc::new(AllowAll),
        };

        if config.cache_key_strategy() == KeyStrategy::IdAction {
            warn!("id_action cache keys are shared by every intent whose plan reuses a step id and action");
        }

        let tools = ToolRegistry::with_builtins(model, config.search_url.clone());
        let executor = CacheAsideExecutor::new(tools, ExecutorConfig::from_config(config));

        info!(
            "Orchestrator ready: planner={:?}, cache={}, failure_mode={:?}",
            config.planner,
            cache.name(),
            config.failure_mode
        );

        Ok(Self::new(planner, Arc::new(executor), cache)
            .with_governor(governor)
            .with_reflector(Arc::new(OutcomeReflector::new()))
            .with_config(OrchestratorConfig {
                failure_mode: config.failure_mode,
                carry_insights: config.carry_insights,
            }))
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Insight from the most recent reflected run
    pub fn last_insight(&self) -> Option<Insight> {
        self.last_insight.read().clone()
    }

    fn planning_context(&self, context: Option<&Context>) -> Option<Context> {
        let carried = if self.config.carry_insights {
            self.last_insight.read().as_ref().map(Insight::to_context_value)
        } else {
            None
        };

        match (context, carried) {
            (Some(ctx), None) => Some(ctx.clone()),
            (ctx, Some(insight)) => {
                let mut merged = ctx.cloned().unwrap_or_default();
                merged.entry(LAST_INSIGHT_KEY.to_string()).or_insert(insight);
                Some(merged)
            }
            (None, None) => None,
        }
    }

    /// Plan, gate, execute and reflect on one intent.
    ///
    /// Only planning failures are errors; denied or failed steps are
    /// recorded in the report.
    pub async fn run(&self, intent: &str, context: Option<&Context>) -> Result<RunReport, PlanningError> {
        let mut state = RunState::Planning;
        debug!("Run state: {}", state);

        let context = self.planning_context(context);
        let plan = self.planner.create_plan(intent, context.as_ref()).await?;
        info!("Plan {} created with {} steps", plan.id, plan.len());

        // context values are addressable by placeholders like step outputs
        let mut outputs: HashMap<String, Value> = context.unwrap_or_default();

        let known: HashSet<String> = outputs.keys().cloned().collect();
        for (step_id, reference) in plan.unresolved_references(&known) {
            warn!("Step {} references '{{{{{}}}}}' which no earlier step produces", step_id, reference);
        }

        let mut results = Vec::with_capacity(plan.len());
        let mut aborted = false;

        for (index, step) in plan.steps().iter().enumerate() {
            state = RunState::Running(index);
            debug!("Run state: {}", state);

            let step = step.resolve(&outputs);
            info!("Step started: {} ({})", step.id(), step.action());

            let decision = self.governor.check_compliance(&step).await;
            if !decision.allowed {
                let reason = decision.reason.unwrap_or_else(|| "denied by policy".to_string());
                warn!("Policy denied step {}: {}", step.id(), reason);
                results.push(StepRecord {
                    step_id: step.id().to_string(),
                    action: step.action().to_string(),
                    outcome: StepOutcome::PolicyDenied { reason },
                });
                continue;
            }

            match self.executor.run_step(&step, self.cache.as_ref()).await {
                Ok(result) => {
                    if let Some(key) = &result.output_key {
                        outputs.insert(key.clone(), result.value.clone());
                    }
                    results.push(StepRecord {
                        step_id: result.step_id,
                        action: step.action().to_string(),
                        outcome: StepOutcome::Completed {
                            value: result.value,
                            cached: result.cached,
                            duration: result.duration,
                        },
                    });
                }
                Err(e) => {
                    warn!("Step failed: {} ({}): {}", step.id(), step.action(), e);
                    results.push(StepRecord {
                        step_id: step.id().to_string(),
                        action: step.action().to_string(),
                        outcome: StepOutcome::Failed { error: e.to_string() },
                    });
                    if self.config.failure_mode == FailureMode::Abort {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        let insight = match &self.reflector {
            Some(reflector) => {
                state = RunState::Reflecting;
                debug!("Run state: {}", state);
                let insight = reflector.reflect(&plan, &results).await;
                *self.last_insight.write() = Some(insight.clone());
                Some(insight)
            }
            None => None,
        };

        state = if aborted { RunState::Aborted } else { RunState::Done };
        info!(
            "Plan {} finished: state={}, {} results",
            plan.id,
            state,
            results.len()
        );

        Ok(RunReport {
            plan,
            results,
            insight,
            aborted,
            state,
        })
    }

    /// Run independent intents concurrently against the shared cache
    pub async fn run_batch(&self, intents: &[&str]) -> Vec<Result<RunReport, PlanningError>> {
        join_all(intents.iter().map(|intent| self.run(intent, None))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::Step;
    use crate::agent::tools::{Tool, ToolSchema};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedPlanner(Vec<Step>);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn create_plan(&self, intent: &str, _context: Option<&Context>) -> Result<Plan, PlanningError> {
            Plan::new(intent, self.0.clone())
        }
    }

    fn echo_tool() -> Tool {
        Tool::new(ToolSchema::new("echo", "echoes its text"), |params| async move {
            Ok(params.get("text").cloned().unwrap_or(Value::Null))
        })
    }

    fn fail_tool() -> Tool {
        Tool::new(ToolSchema::new("fail", "always fails"), |_params| async move {
            Err(anyhow::anyhow!("boom"))
        })
    }

    fn orchestrator(steps: Vec<Step>) -> Orchestrator {
        let tools = ToolRegistry::new().with(echo_tool()).with(fail_tool());
        Orchestrator::new(
            Arc::new(FixedPlanner(steps)),
            Arc::new(CacheAsideExecutor::new(tools, ExecutorConfig::default())),
            Arc::new(InMemoryCache::new()),
        )
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running(2).to_string(), "running(2)");
        assert_eq!(RunState::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_step_outcome_serialization() {
        let record = StepRecord {
            step_id: "s1".to_string(),
            action: "echo".to_string(),
            outcome: StepOutcome::Completed {
                value: json!("hi"),
                cached: true,
                duration: Duration::from_millis(12),
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["duration_ms"], 12);
        assert_eq!(value["cached"], true);
    }

    #[tokio::test]
    async fn test_outputs_flow_between_steps() {
        let orch = orchestrator(vec![
            Step::new("s1", "echo")
                .with_param("text", "alpha")
                .with_output_key("first"),
            Step::new("s2", "echo").with_param("text", "got {{first}}"),
        ]);

        let report = orch.run("chain", None).await.unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.results[1].outcome.value(), Some(&json!("got alpha")));
    }

    #[tokio::test]
    async fn test_context_values_fill_placeholders() {
        let orch = orchestrator(vec![Step::new("s1", "echo").with_param("text", "{{topic}}")]);
        let mut context = Context::new();
        context.insert("topic".to_string(), json!("rust"));

        let report = orch.run("ctx", Some(&context)).await.unwrap();
        assert_eq!(report.results[0].outcome.value(), Some(&json!("rust")));
    }

    #[tokio::test]
    async fn test_abort_stops_at_first_failure() {
        let orch = orchestrator(vec![
            Step::new("s1", "echo").with_param("text", "ok"),
            Step::new("s2", "fail"),
            Step::new("s3", "echo").with_param("text", "never"),
        ])
        .with_reflector(Arc::new(OutcomeReflector::new()))
        .with_config(OrchestratorConfig {
            failure_mode: FailureMode::Abort,
            carry_insights: false,
        });

        let report = orch.run("abort", None).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.results.len(), 2);
        assert!(matches!(report.results[1].outcome, StepOutcome::Failed { .. }));
        let insight = report.insight.unwrap();
        assert_eq!(insight.failed, 1);
        assert_eq!(insight.skipped, 1);
    }

    #[tokio::test]
    async fn test_continue_collects_failures() {
        let orch = orchestrator(vec![
            Step::new("s1", "fail"),
            Step::new("s2", "echo").with_param("text", "still runs"),
        ]);

        let report = orch.run("continue", None).await.unwrap();
        assert!(!report.aborted);
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.results.len(), 2);
        assert!(report.results[1].outcome.is_completed());
        assert!(report.insight.is_none());
    }

    #[tokio::test]
    async fn test_carry_insights_into_next_plan() {
        struct ContextRecorder(parking_lot::Mutex<Vec<bool>>);

        #[async_trait]
        impl Planner for ContextRecorder {
            async fn create_plan(&self, intent: &str, context: Option<&Context>) -> Result<Plan, PlanningError> {
                self.0
                    .lock()
                    .push(context.is_some_and(|c| c.contains_key(LAST_INSIGHT_KEY)));
                Plan::new(intent, vec![])
            }
        }

        let recorder = Arc::new(ContextRecorder(parking_lot::Mutex::new(vec![])));
        let orch = Orchestrator::new(
            recorder.clone(),
            Arc::new(CacheAsideExecutor::new(ToolRegistry::new(), ExecutorConfig::default())),
            Arc::new(InMemoryCache::new()),
        )
        .with_reflector(Arc::new(OutcomeReflector::new()))
        .with_config(OrchestratorConfig {
            failure_mode: FailureMode::Continue,
            carry_insights: true,
        });

        orch.run("first", None).await.unwrap();
        orch.run("second", None).await.unwrap();

        assert_eq!(*recorder.0.lock(), vec![false, true]);
        assert!(orch.last_insight().is_some());
    }
}
