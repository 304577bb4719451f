//! Retry for action dispatch
//!
//! - Error classification from the failure message (never the action tag)
//! - Exponential backoff with jitter
//!
//! Cache reads never pass through here; only the action call is retried.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Classification of errors for recovery strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure, retry likely to succeed
    Transient,
    /// Rate limiting, need backoff
    RateLimited,
    /// Resource unavailable, may recover
    ResourceUnavailable,
    /// Invalid input, retry won't help
    ValidationError,
    /// Authorization failed, needs intervention
    AuthError,
    /// Provider-side failure
    SystemError,
    Unknown,
}

impl ErrorClass {
    /// Classify an error from its message
    pub fn from_error(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("connection") || lower.contains("temporary") {
            Self::Transient
        } else if lower.contains("unavailable") || lower.contains("503") {
            Self::ResourceUnavailable
        } else if lower.contains("missing required")
            || lower.contains("wrong type")
            || lower.contains("invalid")
            || lower.contains("400")
        {
            Self::ValidationError
        } else if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("api key not set")
            || lower.contains("401")
            || lower.contains("403")
        {
            Self::AuthError
        } else if lower.contains("internal") || lower.contains("500") {
            Self::SystemError
        } else {
            Self::Unknown
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::ResourceUnavailable)
    }
}

/// Errors that know their own [`ErrorClass`]
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for String {
    fn class(&self) -> ErrorClass {
        ErrorClass::from_error(self)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: usize,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retry
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Calculate delay for a given attempt
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.add_jitter {
            let jitter = capped * self.jitter_factor * (rand_simple() * 2.0 - 1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Run `operation`, retrying retryable failures up to `max_retries` times.
    ///
    /// The last error is returned once retries are exhausted or the failure
    /// is classified as permanent.
    pub async fn run<F, Fut, T, E>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let class = e.class();
                    if !class.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        "Retry {} for '{}' after {:?} ({:?}: {})",
                        attempt + 1,
                        name,
                        delay,
                        class,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Simple pseudo-random for jitter (avoid heavy rand dependency)
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}
