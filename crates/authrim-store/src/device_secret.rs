//! Native SSO device secrets: per-user capped, hash-at-rest, atomic
//! validate-and-use with a bounded use count.

use authrim_crypto::{random_token, SecretHasher};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceSecretError {
    #[error("Device secret not found")]
    NotFound,
    #[error("Device secret is inactive")]
    Inactive,
    #[error("Device secret expired")]
    Expired,
    #[error("Device secret mismatch")]
    SecretMismatch,
    #[error("Device secret cap reached")]
    CapExceeded,
    #[error("Device secret store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapPolicy {
    RevokeOldest,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSecret {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub use_count: u64,
    pub is_active: bool,
    pub max_use_count: u64,
}

#[derive(Debug, Clone)]
pub struct IssuedDeviceSecret {
    pub id: String,
    /// Returned to the caller exactly once; only the hash is stored.
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait DeviceSecretStore: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        ttl: Duration,
        max_use_count: u64,
        per_user_cap: u64,
        policy: CapPolicy,
    ) -> Result<IssuedDeviceSecret, DeviceSecretError>;

    /// Atomic: secret verification and use-count increment happen in one
    /// critical section; crossing `max_use_count` deactivates the record.
    async fn validate_and_use(
        &self,
        id: &str,
        secret: &str,
    ) -> Result<DeviceSecret, DeviceSecretError>;

    async fn get(&self, id: &str) -> Result<Option<DeviceSecret>, DeviceSecretError>;

    async fn revoke_for_session(&self, session_id: &str) -> Result<usize, DeviceSecretError>;

    async fn revoke_for_user(&self, user_id: &str) -> Result<usize, DeviceSecretError>;
}

pub struct InMemoryDeviceSecretStore {
    secrets: DashMap<String, DeviceSecret>,
    by_user: DashMap<String, Vec<String>>,
    hasher: SecretHasher,
}

impl InMemoryDeviceSecretStore {
    pub fn new() -> Self {
        Self {
            secrets: DashMap::new(),
            by_user: DashMap::new(),
            hasher: SecretHasher::new(),
        }
    }

    fn active_count(&self, user_id: &str, now: DateTime<Utc>) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.secrets
                            .get(*id)
                            .map(|s| s.is_active && s.expires_at > now)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryDeviceSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DeviceSecretStore for InMemoryDeviceSecretStore {
    async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        ttl: Duration,
        max_use_count: u64,
        per_user_cap: u64,
        policy: CapPolicy,
    ) -> Result<IssuedDeviceSecret, DeviceSecretError> {
        let now = Utc::now();
        let mut active = self.active_count(user_id, now);

        if active.len() as u64 >= per_user_cap {
            match policy {
                CapPolicy::Reject => return Err(DeviceSecretError::CapExceeded),
                CapPolicy::RevokeOldest => {
                    active.sort_by_key(|id| {
                        self.secrets.get(id).map(|s| s.created_at).unwrap_or(now)
                    });
                    let overflow = active.len() as u64 + 1 - per_user_cap;
                    for id in active.iter().take(overflow as usize) {
                        if let Some(mut s) = self.secrets.get_mut(id) {
                            s.is_active = false;
                        }
                    }
                }
            }
        }

        let id = format!("ds_{}", random_token(12));
        let secret = random_token(32);
        let secret_hash = self
            .hasher
            .hash_secret(&secret)
            .map_err(DeviceSecretError::StoreUnavailable)?;

        let record = DeviceSecret {
            id: id.clone(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            secret_hash,
            created_at: now,
            expires_at: now + ttl,
            use_count: 0,
            is_active: true,
            max_use_count,
        };
        self.secrets.insert(id.clone(), record);
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .push(id.clone());

        Ok(IssuedDeviceSecret {
            id,
            secret,
            expires_at: now + ttl,
        })
    }

    async fn validate_and_use(
        &self,
        id: &str,
        secret: &str,
    ) -> Result<DeviceSecret, DeviceSecretError> {
        let mut entry = self.secrets.get_mut(id).ok_or(DeviceSecretError::NotFound)?;
        let record = entry.value_mut();

        if !record.is_active {
            return Err(DeviceSecretError::Inactive);
        }
        if record.expires_at <= Utc::now() {
            record.is_active = false;
            return Err(DeviceSecretError::Expired);
        }
        if !self.hasher.verify_secret(secret, &record.secret_hash) {
            return Err(DeviceSecretError::SecretMismatch);
        }

        record.use_count += 1;
        if record.use_count >= record.max_use_count {
            record.is_active = false;
        }
        Ok(record.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<DeviceSecret>, DeviceSecretError> {
        Ok(self.secrets.get(id).map(|s| s.clone()))
    }

    async fn revoke_for_session(&self, session_id: &str) -> Result<usize, DeviceSecretError> {
        let mut revoked = 0;
        for mut entry in self.secrets.iter_mut() {
            if entry.session_id == session_id && entry.is_active {
                entry.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_for_user(&self, user_id: &str) -> Result<usize, DeviceSecretError> {
        let mut revoked = 0;
        for mut entry in self.secrets.iter_mut() {
            if entry.user_id == user_id && entry.is_active {
                entry.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_validate_and_use_counts_down() {
        let store = InMemoryDeviceSecretStore::new();
        let issued = store
            .create("user-1", "sess_00_a", Duration::days(90), 2, 10, CapPolicy::RevokeOldest)
            .await
            .unwrap();

        let first = store.validate_and_use(&issued.id, &issued.secret).await.unwrap();
        assert_eq!(first.use_count, 1);
        assert!(first.is_active);

        let second = store.validate_and_use(&issued.id, &issued.secret).await.unwrap();
        assert_eq!(second.use_count, 2);
        assert!(!second.is_active, "max use count flips is_active");

        let err = store.validate_and_use(&issued.id, &issued.secret).await.unwrap_err();
        assert!(matches!(err, DeviceSecretError::Inactive));
    }

    #[tokio::test]
    async fn test_wrong_secret_does_not_burn_a_use() {
        let store = InMemoryDeviceSecretStore::new();
        let issued = store
            .create("user-1", "sess_00_a", Duration::days(90), 5, 10, CapPolicy::RevokeOldest)
            .await
            .unwrap();

        let err = store.validate_and_use(&issued.id, "wrong").await.unwrap_err();
        assert!(matches!(err, DeviceSecretError::SecretMismatch));

        let ok = store.validate_and_use(&issued.id, &issued.secret).await.unwrap();
        assert_eq!(ok.use_count, 1);
    }

    #[tokio::test]
    async fn test_per_user_cap_reject() {
        let store = InMemoryDeviceSecretStore::new();
        for _ in 0..2 {
            store
                .create("user-1", "sess_00_a", Duration::days(90), 5, 2, CapPolicy::Reject)
                .await
                .unwrap();
        }
        let err = store
            .create("user-1", "sess_00_a", Duration::days(90), 5, 2, CapPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceSecretError::CapExceeded));
    }

    #[tokio::test]
    async fn test_per_user_cap_revoke_oldest() {
        let store = InMemoryDeviceSecretStore::new();
        let first = store
            .create("user-1", "sess_00_a", Duration::days(90), 5, 2, CapPolicy::RevokeOldest)
            .await
            .unwrap();
        store
            .create("user-1", "sess_00_b", Duration::days(90), 5, 2, CapPolicy::RevokeOldest)
            .await
            .unwrap();
        store
            .create("user-1", "sess_00_c", Duration::days(90), 5, 2, CapPolicy::RevokeOldest)
            .await
            .unwrap();

        let err = store.validate_and_use(&first.id, &first.secret).await.unwrap_err();
        assert!(matches!(err, DeviceSecretError::Inactive));
    }

    #[tokio::test]
    async fn test_session_logout_revokes_bound_secrets() {
        let store = InMemoryDeviceSecretStore::new();
        let issued = store
            .create("user-1", "sess_00_gone", Duration::days(90), 5, 10, CapPolicy::RevokeOldest)
            .await
            .unwrap();
        assert_eq!(store.revoke_for_session("sess_00_gone").await.unwrap(), 1);
        let err = store.validate_and_use(&issued.id, &issued.secret).await.unwrap_err();
        assert!(matches!(err, DeviceSecretError::Inactive));
    }
}
