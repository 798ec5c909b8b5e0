//! External identities (DIDs, social providers) linked to local users.
//! Unique on (provider_id, provider_user_id).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkedIdentityError {
    #[error("Identity already linked")]
    AlreadyLinked,
    #[error("Linked identity not found")]
    NotFound,
    #[error("Linked identity store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedIdentity {
    pub user_id: String,
    pub provider_id: String,
    pub provider_user_id: String,
    pub linked_at: DateTime<Utc>,
    pub raw_attributes: serde_json::Value,
}

#[async_trait::async_trait]
pub trait LinkedIdentityStore: Send + Sync {
    async fn link(&self, identity: LinkedIdentity) -> Result<(), LinkedIdentityError>;
    async fn find(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>, LinkedIdentityError>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<LinkedIdentity>, LinkedIdentityError>;
    async fn unlink(
        &self,
        user_id: &str,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<(), LinkedIdentityError>;
}

pub struct InMemoryLinkedIdentityStore {
    // (provider, provider_user) -> identity
    identities: DashMap<(String, String), LinkedIdentity>,
}

impl InMemoryLinkedIdentityStore {
    pub fn new() -> Self {
        Self {
            identities: DashMap::new(),
        }
    }
}

impl Default for InMemoryLinkedIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LinkedIdentityStore for InMemoryLinkedIdentityStore {
    async fn link(&self, identity: LinkedIdentity) -> Result<(), LinkedIdentityError> {
        let key = (
            identity.provider_id.clone(),
            identity.provider_user_id.clone(),
        );
        match self.identities.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LinkedIdentityError::AlreadyLinked),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(identity);
                Ok(())
            }
        }
    }

    async fn find(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>, LinkedIdentityError> {
        let key = (provider_id.to_string(), provider_user_id.to_string());
        Ok(self.identities.get(&key).map(|i| i.clone()))
    }

    async fn list_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<LinkedIdentity>, LinkedIdentityError> {
        Ok(self
            .identities
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.clone())
            .collect())
    }

    async fn unlink(
        &self,
        user_id: &str,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<(), LinkedIdentityError> {
        let key = (provider_id.to_string(), provider_user_id.to_string());
        match self.identities.get(&key) {
            Some(existing) if existing.user_id == user_id => {
                drop(existing);
                self.identities.remove(&key);
                Ok(())
            }
            _ => Err(LinkedIdentityError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn did_identity(user: &str, did: &str) -> LinkedIdentity {
        LinkedIdentity {
            user_id: user.to_string(),
            provider_id: "did".to_string(),
            provider_user_id: did.to_string(),
            linked_at: Utc::now(),
            raw_attributes: serde_json::json!({ "method": "key" }),
        }
    }

    #[tokio::test]
    async fn test_uniqueness_on_provider_pair() {
        let store = InMemoryLinkedIdentityStore::new();
        store.link(did_identity("user-1", "did:key:abc")).await.unwrap();
        let err = store
            .link(did_identity("user-2", "did:key:abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkedIdentityError::AlreadyLinked));
    }

    #[tokio::test]
    async fn test_list_and_unlink() {
        let store = InMemoryLinkedIdentityStore::new();
        store.link(did_identity("user-1", "did:key:abc")).await.unwrap();
        store.link(did_identity("user-1", "did:web:example.com")).await.unwrap();

        assert_eq!(store.list_by_user("user-1").await.unwrap().len(), 2);

        store.unlink("user-1", "did", "did:key:abc").await.unwrap();
        assert_eq!(store.list_by_user("user-1").await.unwrap().len(), 1);

        // Unlinking someone else's identity fails.
        let err = store
            .unlink("user-2", "did", "did:web:example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, LinkedIdentityError::NotFound));
    }
}
