//! Step Result Cache
//!
//! Key-value store with an optional per-entry TTL. Every stage of the
//! pipeline talks to the cache through the [`Cache`] trait so the backing
//! store can be swapped without touching callers:
//!
//! - [`InMemoryCache`]: moka-backed, per-entry expiry, optional capacity bound
//! - [`RedisCache`]: shared across processes, JSON-encoded values
//!
//! An expired entry is never returned. A store failure surfaces as
//! [`CacheError`] and callers treat it as a miss (or a skipped write).

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub mod distributed;
pub mod memory;

pub use distributed::RedisCache;
pub use memory::InMemoryCache;

/// Errors raised by a cache backend
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cached value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

impl CacheStats {
    pub(crate) fn from_counts(entries: u64, hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        Self {
            entries,
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Storage contract shared by every cache variant.
///
/// `get` returns `Ok(None)` for a missing or expired key. `set` with
/// `ttl = None` stores an entry that never expires; overwriting a key
/// replaces both its value and its expiry. In-memory TTLs run on moka's
/// monotonic clock rather than wall-clock time; redis TTLs expire server-side.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Backend name for log events
    fn name(&self) -> &'static str;
}

/// Shortened key for log lines (SHA256 keys are long)
pub(crate) fn short_key(key: &str) -> &str {
    match key.char_indices().nth(24) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_hit_rate() {
        let stats = CacheStats::from_counts(3, 3, 1);
        assert_eq!(stats.hit_rate_percent, 75.0);

        let empty = CacheStats::from_counts(0, 0, 0);
        assert_eq!(empty.hit_rate_percent, 0.0);
    }

    #[test]
    fn test_short_key() {
        assert_eq!(short_key("step-1:noop"), "step-1:noop");
        let long = "a".repeat(64);
        assert_eq!(short_key(&long).len(), 24);
    }
}
