//! Two-level JSON cache: L1 in-process, L2 Redis (optional).
//!
//! Backs the durable-KV layer of the configuration provider and the
//! rate-limit counters. Reads fall through L1 → L2; L2 errors degrade to
//! L1-only operation.

use async_trait::async_trait;
use authrim_config::{ConfigError, KvStore};
use dashmap::DashMap;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T>;
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

pub struct MultiLevelCache {
    l1: DashMap<String, (String, Option<Instant>)>,
    l1_counters: DashMap<String, (u64, Instant)>,
    l2: Option<Client>,
}

impl MultiLevelCache {
    pub fn new(redis_url: Option<&str>) -> anyhow::Result<Self> {
        let l2 = match redis_url {
            Some(url) => Some(Client::open(url)?),
            None => None,
        };
        Ok(Self {
            l1: DashMap::new(),
            l1_counters: DashMap::new(),
            l2,
        })
    }

    pub fn invalidate_l1(&self, key: &str) {
        self.l1.remove(key);
    }

    fn l1_get(&self, key: &str) -> Option<String> {
        let entry = self.l1.get(key)?;
        match entry.1 {
            Some(deadline) if deadline <= Instant::now() => {
                drop(entry);
                self.l1.remove(key);
                None
            }
            _ => Some(entry.0.clone()),
        }
    }

    async fn l2_conn(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.l2.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                error!("redis connection error: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Cache for MultiLevelCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        if let Some(raw) = self.l1_get(key) {
            debug!("L1 cache hit: {}", key);
            if let Ok(value) = serde_json::from_str(&raw) {
                return Some(value);
            }
        }

        let mut conn = self.l2_conn().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => {
                debug!("L2 cache hit: {}", key);
                self.l1.insert(
                    key.to_string(),
                    (raw.clone(), Some(Instant::now() + Duration::from_secs(60))),
                );
                serde_json::from_str(&raw).ok()
            }
            Ok(None) => None,
            Err(e) => {
                error!("redis get error: {}", e);
                None
            }
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let raw = serde_json::to_string(value)?;
        self.l1
            .insert(key.to_string(), (raw.clone(), Some(Instant::now() + ttl)));

        if let Some(mut conn) = self.l2_conn().await {
            let _: redis::RedisResult<()> = conn.set_ex(key, raw, ttl.as_secs()).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.l1.remove(key);
        if let Some(mut conn) = self.l2_conn().await {
            let _: redis::RedisResult<()> = conn.del(key).await;
        }
        Ok(())
    }
}

/// The cache doubles as the durable-KV configuration layer and the
/// rate-limit counter store.
#[async_trait]
impl KvStore for MultiLevelCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        if let Some(raw) = self.l1_get(key) {
            return Ok(Some(raw));
        }
        let Some(mut conn) = self.l2_conn().await else {
            return Ok(None);
        };
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| ConfigError::KvError(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ConfigError> {
        self.l1.insert(
            key.to_string(),
            (value.to_string(), ttl.map(|t| Instant::now() + t)),
        );
        if let Some(mut conn) = self.l2_conn().await {
            let result: redis::RedisResult<()> = match ttl {
                Some(t) => conn.set_ex(key, value, t.as_secs()).await,
                None => conn.set(key, value).await,
            };
            result.map_err(|e| ConfigError::KvError(e.to_string()))?;
        }
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, ConfigError> {
        if let Some(mut conn) = self.l2_conn().await {
            let count: u64 = conn
                .incr(key, 1u64)
                .await
                .map_err(|e| ConfigError::KvError(e.to_string()))?;
            if count == 1 {
                let _: redis::RedisResult<()> = conn.expire(key, ttl.as_secs() as i64).await;
            }
            return Ok(count);
        }

        // L1 fallback with a window fixed at first increment.
        let now = Instant::now();
        let mut entry = self
            .l1_counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigError> {
        self.l1.remove(key);
        self.l1_counters.remove(key);
        if let Some(mut conn) = self.l2_conn().await {
            let _: redis::RedisResult<()> = conn.del(key).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_l1_round_trip_without_redis() {
        let cache = MultiLevelCache::new(None).unwrap();
        Cache::set(&cache, "k", &serde_json::json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        let value: serde_json::Value = Cache::get(&cache, "k").await.unwrap();
        assert_eq!(value["a"], 1);

        Cache::delete(&cache, "k").await.unwrap();
        assert!(Cache::get::<serde_json::Value>(&cache, "k").await.is_none());
    }

    #[tokio::test]
    async fn test_kv_counter_fallback() {
        let cache = MultiLevelCache::new(None).unwrap();
        assert_eq!(KvStore::incr(&cache, "counter", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(KvStore::incr(&cache, "counter", Duration::from_secs(60)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_l1_expiry() {
        let cache = MultiLevelCache::new(None).unwrap();
        KvStore::put(&cache, "k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(KvStore::get(&cache, "k").await.unwrap().is_none());
    }
}
