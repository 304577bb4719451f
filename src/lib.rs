//! Agentic Pipeline
//!
//! Turns a natural-language intent into a plan of steps and runs it through
//! a policy gate and a cache-aside executor, then reflects on the outcome.
//!
//! # Features
//!
//! - **Planning**: fixed template or model-drafted plans with `{{key}}` data flow
//! - **Governance**: TOML policy (allowed actions, blocked terms, cost limit)
//! - **Cache-Aside Execution**: per-entry TTL, single-flight, timeout + retry
//! - **Caches**: Moka in-process or Redis shared
//! - **Reflection**: outcome counts, output flags, arithmetic claim checks
//!
//! # Architecture
//!
//! ```text
//! intent ──► Planner ──► [ Governor ──► Executor ──► Tool ] ──► Reflector ──► Insight
//!                                          │
//!                                          └── Cache (Moka / Redis)
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod llm;

pub use agent::{Orchestrator, Plan, RunReport, Step};
pub use cache::{Cache, CacheError, InMemoryCache, RedisCache};
pub use config::Config;
pub use llm::{ModelClient, ModelError};
