//! Windowed rate limiting over the config KV store.
//!
//! Counters fail open on store errors: an unreachable counter store must
//! never turn into an authentication bypass, only into lost throttling.

use crate::error::OAuthError;
use authrim_config::KvStore;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub max_requests: u64,
    pub window: Duration,
    /// When set, exceeding the window also blocks the key for this long.
    pub block: Option<Duration>,
}

pub mod rules {
    pub const ANON_LOGIN: &str = "anon_login";
    pub const OTP_SEND: &str = "otp_send";
    pub const OTP_VERIFY: &str = "otp_verify";
    pub const NATIVE_SSO: &str = "native_sso";
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    rules: HashMap<String, RateLimitRule>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            rules::ANON_LOGIN.to_string(),
            RateLimitRule {
                max_requests: 10,
                window: Duration::from_secs(60),
                block: None,
            },
        );
        rules.insert(
            rules::OTP_SEND.to_string(),
            RateLimitRule {
                max_requests: 5,
                window: Duration::from_secs(900),
                block: None,
            },
        );
        rules.insert(
            rules::OTP_VERIFY.to_string(),
            RateLimitRule {
                max_requests: 5,
                window: Duration::from_secs(600),
                block: None,
            },
        );
        rules.insert(
            rules::NATIVE_SSO.to_string(),
            RateLimitRule {
                max_requests: 10,
                window: Duration::from_secs(60),
                block: Some(Duration::from_secs(300)),
            },
        );
        Self { kv, rules }
    }

    pub fn with_rule(mut self, name: &str, rule: RateLimitRule) -> Self {
        self.rules.insert(name.to_string(), rule);
        self
    }

    /// Count an attempt for `key` under `rule_name`. Acquisition is
    /// jittered so synchronized clients do not stampede a shared counter.
    pub async fn check(&self, rule_name: &str, key: &str) -> Result<(), OAuthError> {
        let Some(rule) = self.rules.get(rule_name) else {
            warn!(rule_name, "unknown rate limit rule, allowing");
            return Ok(());
        };

        let jitter = rand::thread_rng().gen_range(0..15u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let block_key = format!("rl:block:{rule_name}:{key}");
        if let Some(block) = rule.block {
            match self.kv.get(&block_key).await {
                Ok(Some(_)) => {
                    return Err(OAuthError::RateLimited {
                        retry_after_seconds: Some(block.as_secs()),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rule_name, error = %e, "rate limit block lookup failed, failing open");
                }
            }
        }

        let counter_key = format!("rl:{rule_name}:{key}");
        let count = match self.kv.incr(&counter_key, rule.window).await {
            Ok(count) => count,
            Err(e) => {
                warn!(rule_name, error = %e, "rate limit counter failed, failing open");
                return Ok(());
            }
        };

        if count > rule.max_requests {
            if let Some(block) = rule.block {
                if let Err(e) = self.kv.put(&block_key, "1", Some(block)).await {
                    warn!(rule_name, error = %e, "rate limit block write failed");
                }
            }
            return Err(OAuthError::RateLimited {
                retry_after_seconds: Some(rule.window.as_secs()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_config::{ConfigError, MemoryKvStore};

    #[tokio::test]
    async fn test_limit_enforced() {
        let limiter = RateLimiter::new(Arc::new(MemoryKvStore::new()));
        for _ in 0..5 {
            limiter.check(rules::OTP_VERIFY, "user-1").await.unwrap();
        }
        let err = limiter.check(rules::OTP_VERIFY, "user-1").await.unwrap_err();
        assert_eq!(err.error_code(), "rate_limited");

        // Another key is unaffected.
        limiter.check(rules::OTP_VERIFY, "user-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_block_duration_applies() {
        let kv = Arc::new(MemoryKvStore::new());
        let limiter = RateLimiter::new(kv.clone()).with_rule(
            rules::NATIVE_SSO,
            RateLimitRule {
                max_requests: 1,
                window: Duration::from_secs(60),
                block: Some(Duration::from_secs(300)),
            },
        );
        limiter.check(rules::NATIVE_SSO, "c:1.2.3.4").await.unwrap();
        let _ = limiter.check(rules::NATIVE_SSO, "c:1.2.3.4").await.unwrap_err();

        // Blocked even though a new window would otherwise allow it.
        let err = limiter.check(rules::NATIVE_SSO, "c:1.2.3.4").await.unwrap_err();
        assert!(matches!(err, OAuthError::RateLimited { retry_after_seconds: Some(300) }));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        struct Broken;

        #[async_trait::async_trait]
        impl KvStore for Broken {
            async fn get(&self, _: &str) -> Result<Option<String>, ConfigError> {
                Err(ConfigError::KvError("down".into()))
            }
            async fn put(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), ConfigError> {
                Err(ConfigError::KvError("down".into()))
            }
            async fn incr(&self, _: &str, _: Duration) -> Result<u64, ConfigError> {
                Err(ConfigError::KvError("down".into()))
            }
            async fn delete(&self, _: &str) -> Result<(), ConfigError> {
                Err(ConfigError::KvError("down".into()))
            }
        }

        let limiter = RateLimiter::new(Arc::new(Broken));
        for _ in 0..20 {
            limiter.check(rules::OTP_VERIFY, "user-1").await.unwrap();
        }
    }
}
