//! Redis Cache
//!
//! Shared cache for orchestrators running in separate processes. Values are
//! stored as JSON text; TTL'd writes use `PSETEX` so Redis owns expiry.

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::{short_key, Cache, CacheError};

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    /// Connect to Redis at `url`; every key is stored under `prefix`
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;

        info!("Redis cache connected (prefix={:?})", prefix);

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        namespaced(&self.prefix, key)
    }
}

fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Milliseconds for PSETEX; zero-length TTLs round up so Redis accepts them
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn unavailable(err: ::redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.full_key(key)).await.map_err(unavailable)?;

        match raw {
            Some(text) => {
                debug!("Cache HIT (redis): {}", short_key(key));
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => {
                debug!("Cache MISS (redis): {}", short_key(key));
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let text = serde_json::to_string(&value)?;
        let full_key = self.full_key(key);

        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .pset_ex(full_key, text, ttl_millis(ttl))
                    .await
                    .map_err(unavailable)?;
            }
            None => {
                let _: () = conn.set(full_key, text).await.map_err(unavailable)?;
            }
        }

        debug!("Cache SET (redis): {} (ttl={:?})", short_key(key), ttl);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_keys() {
        assert_eq!(namespaced("agentic", "step-1:noop"), "agentic:step-1:noop");
        assert_eq!(namespaced("", "step-1:noop"), "step-1:noop");
    }

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisCache::connect("not-a-redis-url", "agentic").await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
    }
}
