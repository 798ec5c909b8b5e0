//! Per-(user, client) OAuth consent records with policy-version tracking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("Consent store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConsent {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub selected_scopes: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub privacy_policy_version: Option<String>,
    pub tos_version: Option<String>,
    pub consent_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait ConsentStore: Send + Sync {
    /// Upsert on (user, client); a re-grant bumps `consent_version`.
    async fn grant(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        selected_scopes: Option<&str>,
        privacy_policy_version: Option<&str>,
        tos_version: Option<&str>,
    ) -> Result<ClientConsent, ConsentError>;

    async fn find(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientConsent>, ConsentError>;

    async fn revoke(&self, user_id: &str, client_id: &str) -> Result<bool, ConsentError>;
}

pub struct InMemoryConsentStore {
    consents: DashMap<(String, String), ClientConsent>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self {
            consents: DashMap::new(),
        }
    }
}

impl Default for InMemoryConsentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn grant(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        selected_scopes: Option<&str>,
        privacy_policy_version: Option<&str>,
        tos_version: Option<&str>,
    ) -> Result<ClientConsent, ConsentError> {
        let key = (user_id.to_string(), client_id.to_string());
        let now = Utc::now();
        let mut entry = self.consents.entry(key).or_insert_with(|| ClientConsent {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            scope: String::new(),
            selected_scopes: None,
            granted_at: now,
            expires_at: None,
            privacy_policy_version: None,
            tos_version: None,
            consent_version: 0,
            created_at: now,
            updated_at: now,
        });
        let consent = entry.value_mut();
        consent.scope = scope.to_string();
        consent.selected_scopes = selected_scopes.map(String::from);
        consent.privacy_policy_version = privacy_policy_version.map(String::from);
        consent.tos_version = tos_version.map(String::from);
        consent.granted_at = now;
        consent.updated_at = now;
        consent.consent_version += 1;
        Ok(consent.clone())
    }

    async fn find(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientConsent>, ConsentError> {
        let key = (user_id.to_string(), client_id.to_string());
        Ok(self.consents.get(&key).map(|c| c.clone()))
    }

    async fn revoke(&self, user_id: &str, client_id: &str) -> Result<bool, ConsentError> {
        let key = (user_id.to_string(), client_id.to_string());
        Ok(self.consents.remove(&key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_regrant_bumps_version() {
        let store = InMemoryConsentStore::new();
        let first = store
            .grant("user-1", "demo-client", "openid profile", None, Some("pp-1"), None)
            .await
            .unwrap();
        assert_eq!(first.consent_version, 1);

        let second = store
            .grant(
                "user-1",
                "demo-client",
                "openid profile email",
                Some("openid profile"),
                Some("pp-2"),
                Some("tos-1"),
            )
            .await
            .unwrap();
        assert_eq!(second.consent_version, 2);
        assert_eq!(second.id, first.id);
        assert_eq!(second.privacy_policy_version.as_deref(), Some("pp-2"));
    }
}
