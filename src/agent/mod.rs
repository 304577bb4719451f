//! Agent Pipeline
//!
//! The cycle every intent goes through:
//! - Planning: intent → ordered [`Plan`] of [`Step`]s
//! - Governance: read-only compliance check per step
//! - Execution: cache-aside dispatch to a registered tool
//! - Reflection: plan + step records → [`Insight`]
//!
//! Planner → Governor → Executor(+Cache) → Reflector

pub mod executor;
pub mod governor;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod reflection;
pub mod tools;

pub use executor::{CacheAsideExecutor, ExecutionError, ExecutionResult, Executor, ExecutorConfig, KeyStrategy};
pub use governor::{AllowAll, ComplianceDecision, Governor, PolicyConfig, PolicyGovernor, PolicyLoadError};
pub use orchestrator::{FailureMode, Orchestrator, OrchestratorConfig, RunReport, RunState, StepOutcome, StepRecord};
pub use planner::{Context, LlmPlanner, Plan, Planner, PlannerConfig, PlanningError, Step, TemplatePlanner};
pub use recovery::{Classify, ErrorClass, RetryPolicy};
pub use reflection::{Insight, OutcomeReflector, ReflectionConfig, Reflector};
pub use tools::{Tool, ToolRegistry, ToolSchema};
