//! Configuration management
//!
//! Loaded once at process start and handed explicitly to each collaborator.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::agent::executor::KeyStrategy;
use crate::agent::orchestrator::FailureMode;

/// Model provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    /// Deterministic local answers, no credentials needed
    Offline,
}

/// Which planner backs `create_plan`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerKind {
    /// Fixed summary + search plan
    Template,
    /// Plan drafted by the model client
    Llm,
}

/// Cache storage selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: Provider,

    /// Anthropic API key (optional - only call_llm needs it)
    pub anthropic_api_key: Option<String>,

    /// OpenAI API key (optional)
    pub openai_api_key: Option<String>,

    /// Default model hint (haiku, sonnet, opus, or a provider model id)
    pub default_model: String,

    pub planner: PlannerKind,

    /// Maximum steps accepted from the LLM planner
    pub max_steps: usize,

    /// JSON search endpoint for search_web (optional)
    pub search_url: Option<String>,

    pub cache_backend: CacheBackend,

    /// Redis URL for the shared cache (optional)
    pub redis_url: Option<String>,

    /// Enable result caching
    pub cache_enabled: bool,

    /// Capacity bound for the in-memory cache
    pub cache_max_entries: u64,

    /// Default TTL in seconds; `None` keeps entries until overwritten
    pub default_ttl_secs: Option<u64>,

    /// Per-action TTL overrides in seconds
    pub action_ttls: HashMap<String, u64>,

    /// Cache key derivation; `None` resolves to content hashing because the
    /// built-in planners number steps `step-N` for every intent
    pub key_strategy: Option<KeyStrategy>,

    /// Timeout for one action dispatch
    pub step_timeout_secs: u64,

    /// Retries for retryable action failures
    pub retry_attempts: usize,

    pub failure_mode: FailureMode,

    /// Deduplicate concurrent executions of the same uncached step
    pub single_flight: bool,

    /// TOML governor policy (optional - allow-all when absent)
    pub policy_path: Option<PathBuf>,

    /// Feed the previous run's insight into the next planning context
    pub carry_insights: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            anthropic_api_key: None,
            openai_api_key: None,
            default_model: "sonnet".to_string(),
            planner: PlannerKind::Template,
            max_steps: 10,
            search_url: None,
            cache_backend: CacheBackend::Memory,
            redis_url: None,
            cache_enabled: true,
            cache_max_entries: 10_000,
            default_ttl_secs: None,
            action_ttls: HashMap::new(),
            key_strategy: None,
            step_timeout_secs: 60,
            retry_attempts: 0,
            failure_mode: FailureMode::Continue,
            single_flight: true,
            policy_path: None,
            carry_insights: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from any key/value source
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let provider = match get("AGENTIC_PROVIDER").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("anthropic") => Provider::Anthropic,
            Some("openai") => Provider::OpenAi,
            Some("offline") => Provider::Offline,
            Some(other) => {
                warn!("Unknown AGENTIC_PROVIDER '{}', using anthropic", other);
                Provider::Anthropic
            }
        };

        let planner = match get("AGENTIC_PLANNER").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("template") => PlannerKind::Template,
            Some("llm") => PlannerKind::Llm,
            Some(other) => {
                warn!("Unknown AGENTIC_PLANNER '{}', using template", other);
                PlannerKind::Template
            }
        };

        let cache_backend = match get("AGENTIC_CACHE_BACKEND").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("memory") => CacheBackend::Memory,
            Some("redis") => CacheBackend::Redis,
            Some(other) => {
                warn!("Unknown AGENTIC_CACHE_BACKEND '{}', using memory", other);
                CacheBackend::Memory
            }
        };

        let key_strategy = match get("AGENTIC_CACHE_KEY").as_deref().map(str::to_lowercase).as_deref() {
            None => None,
            Some("id_action") => Some(KeyStrategy::IdAction),
            Some("content") => Some(KeyStrategy::ContentHash),
            Some(other) => {
                warn!("Unknown AGENTIC_CACHE_KEY '{}', using content", other);
                None
            }
        };

        let failure_mode = match get("AGENTIC_FAILURE_MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("continue") => FailureMode::Continue,
            Some("abort") => FailureMode::Abort,
            Some(other) => {
                warn!("Unknown AGENTIC_FAILURE_MODE '{}', using continue", other);
                FailureMode::Continue
            }
        };

        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };

        let number = |key: &str| -> Option<u64> {
            let raw = get(key)?;
            match raw.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("Ignoring non-numeric {}='{}'", key, raw);
                    None
                }
            }
        };

        let action_ttls = get("AGENTIC_ACTION_TTLS")
            .map(|raw| parse_action_ttls(&raw))
            .unwrap_or_default();

        Ok(Self {
            provider,
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            openai_api_key: get("OPENAI_API_KEY"),
            default_model: get("AGENTIC_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            planner,
            max_steps: number("AGENTIC_MAX_STEPS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_steps),
            search_url: get("AGENTIC_SEARCH_URL"),
            cache_backend,
            redis_url: get("REDIS_URL"),
            cache_enabled: flag("AGENTIC_CACHE_ENABLED", defaults.cache_enabled),
            cache_max_entries: number("AGENTIC_CACHE_MAX_ENTRIES").unwrap_or(defaults.cache_max_entries),
            default_ttl_secs: number("AGENTIC_CACHE_TTL"),
            action_ttls,
            key_strategy,
            step_timeout_secs: number("AGENTIC_STEP_TIMEOUT").unwrap_or(defaults.step_timeout_secs),
            retry_attempts: number("AGENTIC_RETRY_ATTEMPTS")
                .map(|n| n as usize)
                .unwrap_or(defaults.retry_attempts),
            failure_mode,
            single_flight: flag("AGENTIC_SINGLE_FLIGHT", defaults.single_flight),
            policy_path: get("AGENTIC_POLICY_PATH").map(PathBuf::from),
            carry_insights: flag("AGENTIC_CARRY_INSIGHTS", defaults.carry_insights),
        })
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Key strategy after resolving the unset default
    pub fn cache_key_strategy(&self) -> KeyStrategy {
        self.key_strategy.unwrap_or(KeyStrategy::ContentHash)
    }
}

/// Parse `search_web=600,call_llm=3600`
fn parse_action_ttls(raw: &str) -> HashMap<String, u64> {
    raw.split(',')
        .filter_map(|pair| {
            let (action, secs) = pair.split_once('=')?;
            match secs.trim().parse() {
                Ok(secs) => Some((action.trim().to_string(), secs)),
                Err(_) => {
                    warn!("Ignoring malformed action TTL '{}'", pair);
                    None
                }
            }
        })
        .collect()
}
