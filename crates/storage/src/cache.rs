//! Short-lived KV cache: Redis when configured, an in-process TTL map
//! otherwise. Keys follow `conv:<id>:recent` / `session:<id>` conventions.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use {redis::AsyncCommands, tracing::warn};

use crate::error::Result;

struct LocalEntry {
    value: String,
    expires_at: Instant,
}

/// KV + TTL cache with best-effort Redis backing.
pub struct Cache {
    redis: Option<redis::aio::ConnectionManager>,
    local: Mutex<HashMap<String, LocalEntry>>,
}

impl Cache {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to Redis; on failure the cache silently degrades to local-only.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let redis = match redis_url {
            None => None,
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                    Ok(manager) => Some(manager),
                    Err(e) => {
                        warn!(error = %e, "redis unavailable, cache degrades to in-memory");
                        None
                    },
                },
                Err(e) => {
                    warn!(error = %e, "invalid REDIS_URL, cache degrades to in-memory");
                    None
                },
            },
        };
        Self {
            redis,
            local: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn backed_by_redis(&self) -> bool {
        self.redis.is_some()
    }

    fn local_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocalEntry>> {
        match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let value: Option<String> = conn.get(key).await?;
            return Ok(value);
        }

        let mut local = self.local_lock();
        match local.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                local.remove(key);
                Ok(None)
            },
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let ttl_secs = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
            return Ok(());
        }

        self.local_lock().insert(key.to_string(), LocalEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        });
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            conn.del::<_, ()>(key).await?;
            return Ok(());
        }
        self.local_lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_cache_round_trip() {
        let cache = Cache::in_memory();
        cache
            .set("session:abc", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("session:abc").await.unwrap(),
            Some("1".to_string())
        );
        cache.del("session:abc").await.unwrap();
        assert_eq!(cache.get("session:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_cache_expires() {
        let cache = Cache::in_memory();
        cache
            .set("conv:x:recent", "[]", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get("conv:x:recent").await.unwrap(), None);
    }
}
