//! Cache-Aside Step Execution
//!
//! For each step:
//! 1. Derive a cache key from the step
//! 2. Return the cached value on a non-empty hit
//! 3. Otherwise dispatch the action (timeout + retry), store the value, return it
//!
//! Failed dispatches are never cached. Concurrent misses on the same key can
//! be collapsed into a single dispatch (single-flight).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as FlightLock, OwnedMutexGuard};
use tracing::{debug, warn};

use super::planner::Step;
use super::recovery::{Classify, ErrorClass, RetryPolicy};
use super::tools::ToolRegistry;
use crate::cache::{short_key, Cache};
use crate::config::Config;

/// How a step maps to a cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// `"{id}:{action}"`. Two steps sharing id and action share a cache
    /// entry even when their parameters differ.
    IdAction,
    /// SHA-256 over id, action and canonical parameters
    ContentHash,
}

impl KeyStrategy {
    pub fn derive(&self, step: &Step) -> String {
        match self {
            Self::IdAction => format!("{}:{}", step.id(), step.action()),
            Self::ContentHash => {
                let mut hasher = Sha256::new();
                hasher.update(step.id().as_bytes());
                hasher.update(b"\x00");
                hasher.update(step.action().as_bytes());
                hasher.update(b"\x00");
                hasher.update(canonical_json(&step.params_value()).as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Serialize with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Null, empty string, empty array and empty object are not worth serving from cache
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on one action dispatch
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// TTL for stored results; `None` keeps them until overwritten
    pub default_ttl: Option<Duration>,
    /// Per-action TTL overrides
    pub action_ttls: HashMap<String, Duration>,
    pub key_strategy: KeyStrategy,
    pub single_flight: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::none(),
            default_ttl: None,
            action_ttls: HashMap::new(),
            key_strategy: KeyStrategy::IdAction,
            single_flight: true,
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.step_timeout(),
            retry: RetryPolicy::none().with_max_retries(config.retry_attempts),
            default_ttl: config.default_ttl(),
            action_ttls: config
                .action_ttls
                .iter()
                .map(|(action, secs)| (action.clone(), Duration::from_secs(*secs)))
                .collect(),
            key_strategy: config.cache_key_strategy(),
            single_flight: config.single_flight,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_action_ttl(mut self, action: &str, ttl: Duration) -> Self {
        self.action_ttls.insert(action.to_string(), ttl);
        self
    }

    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    fn ttl_for(&self, action: &str) -> Option<Duration> {
        self.action_ttls.get(action).copied().or(self.default_ttl)
    }
}

/// Successful step execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub step_id: String,
    pub output_key: Option<String>,
    pub value: Value,
    /// Served from cache without dispatching
    pub cached: bool,
    pub duration: Duration,
}

/// Step execution failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Action '{action}' failed: {message}")]
    Action { action: String, message: String },

    #[error("Action '{action}' timed out after {after:?}")]
    Timeout { action: String, after: Duration },
}

impl ExecutionError {
    /// The failure text without the action tag, used for retry classification
    pub fn detail(&self) -> String {
        match self {
            Self::UnknownAction(_) => "unknown action".to_string(),
            Self::Action { message, .. } => message.clone(),
            Self::Timeout { after, .. } => format!("timed out after {:?}", after),
        }
    }
}

impl Classify for ExecutionError {
    fn class(&self) -> ErrorClass {
        ErrorClass::from_error(&self.detail())
    }
}

/// Runs one step against a cache
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_step(&self, step: &Step, cache: &dyn Cache) -> Result<ExecutionResult, ExecutionError>;
}

type FlightMap = Arc<Mutex<HashMap<String, Arc<FlightLock<()>>>>>;

/// Held by the single caller allowed to dispatch for a key
struct FlightGuard {
    key: String,
    lock: Arc<FlightLock<()>>,
    flights: FlightMap,
    _held: OwnedMutexGuard<()>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        // map + self.lock + _held means nobody else is waiting
        if let Some(current) = flights.get(&self.key) {
            if Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) <= 3 {
                flights.remove(&self.key);
            }
        }
    }
}

/// Default executor: cache-aside over a [`ToolRegistry`]
pub struct CacheAsideExecutor {
    tools: ToolRegistry,
    config: ExecutorConfig,
    flights: FlightMap,
}

impl CacheAsideExecutor {
    pub fn new(tools: ToolRegistry, config: ExecutorConfig) -> Self {
        Self {
            tools,
            config,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Number of keys with a dispatch in progress
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    async fn lookup(&self, cache: &dyn Cache, key: &str) -> Option<Value> {
        match cache.get(key).await {
            Ok(Some(value)) if !is_empty_value(&value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!("Cache read failed for {} ({}): {}", short_key(key), cache.name(), e);
                None
            }
        }
    }

    async fn store(&self, cache: &dyn Cache, key: &str, action: &str, value: &Value) {
        if is_empty_value(value) {
            debug!("Not caching empty result for {}", short_key(key));
            return;
        }
        if let Err(e) = cache.set(key, value.clone(), self.config.ttl_for(action)).await {
            warn!("Cache write failed for {} ({}): {}", short_key(key), cache.name(), e);
        }
    }

    async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = {
            let mut flights = self.flights.lock();
            Arc::clone(
                flights
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(FlightLock::new(()))),
            )
        };
        let held = Arc::clone(&lock).lock_owned().await;
        FlightGuard {
            key: key.to_string(),
            lock,
            flights: Arc::clone(&self.flights),
            _held: held,
        }
    }

    async fn dispatch(&self, step: &Step) -> Result<Value, ExecutionError> {
        let action = step.action();
        let tool = self
            .tools
            .get(action)
            .ok_or_else(|| ExecutionError::UnknownAction(action.to_string()))?;
        let params = step.params_value();
        let timeout = self.config.timeout;

        self.config
            .retry
            .run(action, || {
                let params = params.clone();
                async move {
                    match tokio::time::timeout(timeout, tool.invoke(params)).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(ExecutionError::Action {
                            action: action.to_string(),
                            message: format!("{:#}", e),
                        }),
                        Err(_) => Err(ExecutionError::Timeout {
                            action: action.to_string(),
                            after: timeout,
                        }),
                    }
                }
            })
            .await
    }

    fn result(step: &Step, value: Value, cached: bool, started: Instant) -> ExecutionResult {
        ExecutionResult {
            step_id: step.id().to_string(),
            output_key: step.output_key().map(str::to_string),
            value,
            cached,
            duration: started.elapsed(),
        }
    }
}

#[async_trait]
impl Executor for CacheAsideExecutor {
    async fn run_step(&self, step: &Step, cache: &dyn Cache) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();

        if self.tools.get(step.action()).is_none() {
            return Err(ExecutionError::UnknownAction(step.action().to_string()));
        }

        let key = self.config.key_strategy.derive(step);

        if let Some(value) = self.lookup(cache, &key).await {
            debug!("Step {} served from cache ({})", step.id(), short_key(&key));
            return Ok(Self::result(step, value, true, started));
        }

        let _flight = if self.config.single_flight {
            let guard = self.acquire(&key).await;
            // a concurrent leader may have stored it while we waited
            if let Some(value) = self.lookup(cache, &key).await {
                debug!("Step {} filled by concurrent run ({})", step.id(), short_key(&key));
                return Ok(Self::result(step, value, true, started));
            }
            Some(guard)
        } else {
            None
        };

        let value = self.dispatch(step).await?;
        self.store(cache, &key, step.action(), &value).await;

        debug!(
            "Step {} executed {} in {:?}",
            step.id(),
            step.action(),
            started.elapsed()
        );
        Ok(Self::result(step, value, false, started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{Tool, ToolSchema};
    use crate::cache::{CacheError, InMemoryCache};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tool(name: &str, calls: Arc<AtomicUsize>, value: Value) -> Tool {
        Tool::new(ToolSchema::new(name, "counts calls"), move |_params| {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    fn executor_with(tool: Tool) -> CacheAsideExecutor {
        CacheAsideExecutor::new(ToolRegistry::new().with(tool), ExecutorConfig::default())
    }

    #[test]
    fn test_id_action_key() {
        let step = Step::new("step-1", "call_llm").with_param("prompt", "x");
        assert_eq!(KeyStrategy::IdAction.derive(&step), "step-1:call_llm");
    }

    #[test]
    fn test_content_hash_key_tracks_params() {
        let a = Step::new("s", "call_llm").with_param("prompt", "a");
        let b = Step::new("s", "call_llm").with_param("prompt", "b");
        let a2 = Step::new("s", "call_llm").with_param("prompt", "a");

        let key = KeyStrategy::ContentHash.derive(&a);
        assert_eq!(key.len(), 64);
        assert_eq!(key, KeyStrategy::ContentHash.derive(&a2));
        assert_ne!(key, KeyStrategy::ContentHash.derive(&b));
        // same id and action collide under the default strategy
        assert_eq!(KeyStrategy::IdAction.derive(&a), KeyStrategy::IdAction.derive(&b));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [true, null]}});
        assert_eq!(canonical_json(&a), r#"{"a":{"x":[true,null],"y":2},"b":1}"#);
    }

    #[test]
    fn test_empty_values() {
        assert!(is_empty_value(&Value::Null));
        assert!(is_empty_value(&json!("")));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!("x")));
    }

    #[tokio::test]
    async fn test_second_run_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(counting_tool("noop", calls.clone(), json!({"status": "ok"})));
        let cache = InMemoryCache::new();
        let step = Step::new("s1", "noop").with_output_key("out");

        let first = executor.run_step(&step, &cache).await.unwrap();
        let second = executor.run_step(&step, &cache).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.value, second.value);
        assert_eq!(second.output_key.as_deref(), Some("out"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::new(ToolSchema::new("flaky", "fails"), move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("upstream exploded"))
            }
        });
        let executor = executor_with(tool);
        let cache = InMemoryCache::new();
        let step = Step::new("s1", "flaky");

        let err = executor.run_step(&step, &cache).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Action { ref message, .. } if message.contains("exploded")));
        assert!(cache.get("s1:flaky").await.unwrap().is_none());

        executor.run_step(&step, &cache).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let executor = CacheAsideExecutor::new(ToolRegistry::new(), ExecutorConfig::default());
        let cache = InMemoryCache::new();

        let err = executor
            .run_step(&Step::new("s1", "teleport"), &cache)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::UnknownAction("teleport".to_string()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let tool = Tool::new(ToolSchema::new("slow", "sleeps"), |_params| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        });
        let executor = CacheAsideExecutor::new(
            ToolRegistry::new().with(tool),
            ExecutorConfig::default().with_timeout(Duration::from_millis(20)),
        );
        let cache = InMemoryCache::new();

        let err = executor.run_step(&Step::new("s1", "slow"), &cache).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert!(err.to_string().contains("timed out"));
        assert!(cache.get("s1:slow").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_cached_value_is_recomputed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(counting_tool("noop", calls.clone(), json!("fresh")));
        let cache = InMemoryCache::new();
        cache.set("s1:noop", json!(""), None).await.unwrap();

        let result = executor.run_step(&Step::new("s1", "noop"), &cache).await.unwrap();
        assert!(!result.cached);
        assert_eq!(result.value, json!("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_result_not_stored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(counting_tool("noop", calls.clone(), json!([])));
        let cache = InMemoryCache::new();
        let step = Step::new("s1", "noop");

        executor.run_step(&step, &cache).await.unwrap();
        executor.run_step(&step, &cache).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(counting_tool("noop", calls.clone(), json!("v")));

        let result = executor.run_step(&Step::new("s1", "noop"), &BrokenCache).await.unwrap();
        assert_eq!(result.value, json!("v"));
        assert!(!result.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_action_ttl_applied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = CacheAsideExecutor::new(
            ToolRegistry::new().with(counting_tool("noop", calls.clone(), json!("v"))),
            ExecutorConfig::default().with_action_ttl("noop", Duration::from_millis(50)),
        );
        let cache = InMemoryCache::new();
        let step = Step::new("s1", "noop");

        executor.run_step(&step, &cache).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let again = executor.run_step(&step, &cache).await.unwrap();

        assert!(!again.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_dedups_concurrent_misses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::new(ToolSchema::new("slow", "sleeps"), move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("done"))
            }
        });
        let executor = Arc::new(executor_with(tool));
        let cache = Arc::new(InMemoryCache::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                let cache = cache.clone();
                tokio::spawn(async move {
                    executor
                        .run_step(&Step::new("s1", "slow"), cache.as_ref())
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().value, json!("done"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_failed_leader_hands_over() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::new(ToolSchema::new("slow", "fails first"), move |_params| {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if attempt == 0 {
                    Err(anyhow::anyhow!("upstream exploded"))
                } else {
                    Ok(json!("done"))
                }
            }
        });
        let executor = Arc::new(executor_with(tool));
        let cache = Arc::new(InMemoryCache::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                let cache = cache.clone();
                tokio::spawn(async move { executor.run_step(&Step::new("s1", "slow"), cache.as_ref()).await })
            })
            .collect();

        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => assert_eq!(result.value, json!("done")),
                Err(_) => failures += 1,
            }
        }
        assert_eq!(failures, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(cache.get("s1:slow").await.unwrap(), Some(json!("done")));
    }

    #[test]
    fn test_classification_ignores_action_tag() {
        let err = ExecutionError::Action {
            action: "connection_check".to_string(),
            message: "invalid host".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::ValidationError);

        let err = ExecutionError::Timeout {
            action: "noop".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(err.class().is_retryable());
    }

    #[tokio::test]
    async fn test_tool_named_like_transient_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::new(ToolSchema::new("connection_check", "fails"), move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("bad input"))
            }
        });
        let retry = RetryPolicy {
            add_jitter: false,
            ..RetryPolicy::none()
                .with_max_retries(3)
                .with_initial_delay(Duration::from_millis(1))
        };
        let executor = CacheAsideExecutor::new(
            ToolRegistry::new().with(tool),
            ExecutorConfig::default().with_retry(retry),
        );
        let cache = InMemoryCache::new();

        executor
            .run_step(&Step::new("s1", "connection_check"), &cache)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_on_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tool = Tool::new(ToolSchema::new("flaky", "fails once"), move |_params| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("temporary glitch"))
                } else {
                    Ok(json!("ok"))
                }
            }
        });
        let retry = RetryPolicy {
            add_jitter: false,
            ..RetryPolicy::none()
                .with_max_retries(1)
                .with_initial_delay(Duration::from_millis(1))
        };
        let executor = CacheAsideExecutor::new(
            ToolRegistry::new().with(tool),
            ExecutorConfig::default().with_retry(retry),
        );
        let cache = InMemoryCache::new();

        let result = executor.run_step(&Step::new("s1", "flaky"), &cache).await.unwrap();
        assert_eq!(result.value, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
