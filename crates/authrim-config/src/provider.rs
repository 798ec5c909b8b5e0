//! Hierarchical configuration lookup: durable KV > environment > default.

use crate::keys::DEFAULTS;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KV store error: {0}")]
    KvError(String),
    #[error("Missing configuration key: {0}")]
    MissingKey(String),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Durable key-value store backing the top lookup layer. Also hosts the
/// rate-limit counters, so it carries an atomic increment.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ConfigError>;
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, ConfigError>;
    async fn delete(&self, key: &str) -> Result<(), ConfigError>;
}

/// In-memory KV for tests and single-node deployments.
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, (String, Option<std::time::Instant>)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, deadline)| {
            match deadline {
                Some(d) if *d <= std::time::Instant::now() => None,
                _ => Some(value.clone()),
            }
        }))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ConfigError> {
        let deadline = ttl.map(|t| std::time::Instant::now() + t);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, ConfigError> {
        let mut entries = self.entries.write().await;
        let now = std::time::Instant::now();
        let current = entries
            .get(key)
            .filter(|(_, deadline)| deadline.map(|d| d > now).unwrap_or(true))
            .and_then(|(v, _)| v.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        // First increment in a window fixes the window deadline.
        let deadline = entries
            .get(key)
            .and_then(|(_, d)| *d)
            .filter(|d| *d > now)
            .unwrap_or(now + ttl);
        entries.insert(key.to_string(), (next.to_string(), Some(deadline)));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Single resolution point for every TTL, flag and tenant setting.
///
/// Priority: durable KV store > `AUTHRIM__`-prefixed environment variable
/// (dots become `__`) > hard-coded default.
pub struct ConfigProvider {
    kv: Option<Arc<dyn KvStore>>,
}

impl ConfigProvider {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv: Some(kv) }
    }

    pub fn defaults_only() -> Self {
        Self { kv: None }
    }

    pub fn kv(&self) -> Option<&Arc<dyn KvStore>> {
        self.kv.as_ref()
    }

    fn env_name(key: &str) -> String {
        format!("AUTHRIM__{}", key.replace('.', "__").to_uppercase())
    }

    /// Raw lookup. KV and environment values are parsed as JSON when they
    /// look like it, otherwise taken as strings.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(kv) = &self.kv {
            match kv.get(key).await {
                Ok(Some(raw)) => return Some(parse_raw(&raw)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key, error = %e, "KV config lookup failed, falling back");
                }
            }
        }
        if let Ok(raw) = std::env::var(Self::env_name(key)) {
            return Some(parse_raw(&raw));
        }
        DEFAULTS.get(key).cloned()
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).await.map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub async fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        match self.get(key).await {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(fallback),
            Some(Value::String(s)) => s.parse().unwrap_or(fallback),
            _ => fallback,
        }
    }

    pub async fn get_bool(&self, key: &str, fallback: bool) -> bool {
        match self.get(key).await {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s.parse().unwrap_or(fallback),
            _ => fallback,
        }
    }

    pub async fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.get(key).await {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => {
                s.split(',').map(|p| p.trim().to_string()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn parse_raw(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[tokio::test]
    async fn test_default_layer() {
        let provider = ConfigProvider::defaults_only();
        assert_eq!(provider.get_u64(keys::TOKEN_ACCESS_TTL, 0).await, 900);
        assert!(provider.get_bool(keys::REFRESH_ROTATION_ENABLED, false).await);
        assert!(provider.get(keys::LOGOUT_WEBHOOK_SECRET_KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_kv_overrides_default() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(keys::TOKEN_ACCESS_TTL, "120", None).await.unwrap();
        let provider = ConfigProvider::new(kv);
        assert_eq!(provider.get_u64(keys::TOKEN_ACCESS_TTL, 0).await, 120);
    }

    #[tokio::test]
    async fn test_env_layer_between_kv_and_default() {
        std::env::set_var("AUTHRIM__CHALLENGE__AUTH_CODE_TTL_SECONDS", "42");
        let provider = ConfigProvider::defaults_only();
        assert_eq!(provider.get_u64(keys::AUTH_CODE_TTL, 0).await, 42);
        std::env::remove_var("AUTHRIM__CHALLENGE__AUTH_CODE_TTL_SECONDS");
    }

    #[tokio::test]
    async fn test_string_list_forms() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(keys::ALLOWED_ORIGINS, r#"["https://a.example","https://b.example"]"#, None)
            .await
            .unwrap();
        let provider = ConfigProvider::new(kv);
        assert_eq!(
            provider.get_string_list(keys::ALLOWED_ORIGINS).await,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[tokio::test]
    async fn test_incr_windows() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.incr("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.incr("k", Duration::from_secs(60)).await.unwrap(), 2);
    }
}
