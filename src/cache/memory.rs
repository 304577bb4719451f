//! In-Memory Cache
//!
//! Moka-backed store with per-entry expiry. Each entry carries its own
//! optional TTL; moka evaluates it on every read and reclaims expired
//! entries during housekeeping, so a stale value is never handed out.

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{short_key, Cache, CacheError, CacheStats};

/// Stored value plus the TTL it was written with
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    ttl: Option<Duration>,
}

/// Expiry policy that reads the TTL off the entry itself.
///
/// Updates return the new entry's TTL so an overwrite replaces the deadline.
struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// Process-local cache shared by concurrent orchestrator runs
#[derive(Clone)]
pub struct InMemoryCache {
    cache: MokaCache<String, CacheEntry>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    enabled: bool,
}

impl InMemoryCache {
    /// Unbounded cache, TTL-only expiry
    pub fn new() -> Self {
        Self::build(None, true)
    }

    /// Cache bounded to `max_entries`; `enabled = false` makes every `get` a miss
    pub fn with_capacity(max_entries: u64, enabled: bool) -> Self {
        Self::build(Some(max_entries), enabled)
    }

    fn build(max_entries: Option<u64>, enabled: bool) -> Self {
        let mut builder = MokaCache::builder().expire_after(PerEntryTtl);
        if let Some(max) = max_entries {
            builder = builder.max_capacity(max);
        }

        Self {
            cache: builder.build(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            enabled,
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats::from_counts(
            self.cache.entry_count(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Drop expired entries and apply pending bookkeeping now
    pub async fn purge_expired(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Invalidate entry
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Clear all entries
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }

        match self.cache.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache HIT: {}", short_key(key));
                Ok(Some(entry.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache MISS: {}", short_key(key));
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }

        self.cache
            .insert(key.to_string(), CacheEntry { value, ttl })
            .await;
        debug!("Cache SET: {} (ttl={:?})", short_key(key), ttl);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache = InMemoryCache::new();

        assert!(cache.get("step-1:noop").await.unwrap().is_none());

        cache
            .set("step-1:noop", json!({"status": "ok"}), None)
            .await
            .unwrap();

        let result = cache.get("step-1:noop").await.unwrap();
        assert_eq!(result, Some(json!({"status": "ok"})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = InMemoryCache::with_capacity(10, false);

        cache.set("k", json!("v"), None).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = InMemoryCache::new();
        cache.set("a", json!(1), None).await.unwrap();
        cache.set("b", json!(2), None).await.unwrap();

        cache.invalidate("a").await;
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));

        cache.clear().await;
        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_overwrite_drops_previous_ttl() {
        let cache = InMemoryCache::new();

        cache
            .set("k", json!("short"), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        cache.set("k", json!("forever"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("forever")));
    }

    #[tokio::test]
    async fn test_expired_entries_reclaimed() {
        let cache = InMemoryCache::new();
        for i in 0..5 {
            cache
                .set(&format!("k{}", i), json!(i), Some(Duration::from_millis(100)))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.get("k0").await.unwrap().is_none());

        cache.purge_expired().await;
        assert_eq!(cache.stats().entries, 0);
    }
}
