//! Opaque user sessions, sharded by id.
//!
//! Session ids carry their shard in a recognizable prefix
//! (`sess_{shard:02x}_{random}`); legacy unprefixed ids are rejected from
//! routable operations.

use crate::shard::effective_shard;
use authrim_crypto::random_token;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SESSION_ID_PREFIX: &str = "sess_";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,
    #[error("Legacy session id is not routable")]
    LegacyId,
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// `amr`, `acr`, `is_anonymous`, `upgrade_eligible`, `verified_email`,
    /// `upgrade_nonce`, `client_id`, `device_id_hash` live here.
    pub data: Map<String, Value>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_anonymous(&self) -> bool {
        self.data
            .get("is_anonymous")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Mint a sharded session id. The shard byte is drawn uniformly so load
/// spreads without a coordinator.
pub fn new_session_id(shard_count: u32) -> String {
    let random = random_token(16);
    let shard = effective_shard(rand::random::<u32>(), shard_count.max(1));
    format!("{SESSION_ID_PREFIX}{shard:02x}_{random}")
}

/// Extract the embedded shard from a sharded session id.
pub fn parse_session_shard(session_id: &str) -> Result<u32, SessionError> {
    let rest = session_id
        .strip_prefix(SESSION_ID_PREFIX)
        .ok_or(SessionError::LegacyId)?;
    let (shard_hex, _) = rest.split_once('_').ok_or(SessionError::LegacyId)?;
    u32::from_str_radix(shard_hex, 16).map_err(|_| SessionError::LegacyId)
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        ttl: Duration,
        data: Map<String, Value>,
    ) -> Result<Session, SessionError>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError>;

    /// Extend the active TTL. Idempotent under clock skew (keeps the max of
    /// current and proposed expiry) and capped at `max_ttl` from now.
    async fn extend(
        &self,
        session_id: &str,
        extra: Duration,
        max_ttl: Duration,
    ) -> Result<Session, SessionError>;

    async fn update_data(
        &self,
        session_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Session, SessionError>;

    /// Re-assign the session's user. Only the anonymous-upgrade flow with
    /// `preserve_sub = false` calls this.
    async fn update_user(&self, session_id: &str, new_user_id: &str) -> Result<Session, SessionError>;

    /// Returns whether a live session was removed.
    async fn invalidate(&self, session_id: &str) -> Result<bool, SessionError>;
}

pub struct ShardedSessionStore {
    shards: Vec<DashMap<String, Session>>,
}

impl ShardedSessionStore {
    pub fn new(shard_count: u32) -> Self {
        let count = shard_count.max(1) as usize;
        Self {
            shards: (0..count).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, session_id: &str) -> Result<&DashMap<String, Session>, SessionError> {
        let raw = parse_session_shard(session_id)?;
        let idx = effective_shard(raw, self.shards.len() as u32) as usize;
        Ok(&self.shards[idx])
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, SessionError> {
        let shard = self.shard(session_id)?;
        let mut entry = match shard.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e,
            dashmap::mapref::entry::Entry::Vacant(_) => return Err(SessionError::NotFound),
        };
        if entry.get().is_expired(Utc::now()) {
            entry.remove();
            return Err(SessionError::NotFound);
        }
        Ok(f(entry.get_mut()))
    }
}

#[async_trait::async_trait]
impl SessionStore for ShardedSessionStore {
    async fn create(
        &self,
        user_id: &str,
        ttl: Duration,
        data: Map<String, Value>,
    ) -> Result<Session, SessionError> {
        let id = new_session_id(self.shards.len() as u32);
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
            data,
        };
        self.shard(&id)?.insert(id, session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let shard = self.shard(session_id)?;
        match shard.get(session_id) {
            Some(s) if s.is_expired(Utc::now()) => Ok(None),
            Some(s) => Ok(Some(s.clone())),
            None => Ok(None),
        }
    }

    async fn extend(
        &self,
        session_id: &str,
        extra: Duration,
        max_ttl: Duration,
    ) -> Result<Session, SessionError> {
        self.with_session(session_id, |session| {
            let now = Utc::now();
            let proposed = now + extra;
            let cap = now + max_ttl;
            session.expires_at = session.expires_at.max(proposed).min(cap);
            session.clone()
        })
    }

    async fn update_data(
        &self,
        session_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Session, SessionError> {
        self.with_session(session_id, |session| {
            for (key, value) in patch {
                if value.is_null() {
                    session.data.remove(&key);
                } else {
                    session.data.insert(key, value);
                }
            }
            session.clone()
        })
    }

    async fn update_user(
        &self,
        session_id: &str,
        new_user_id: &str,
    ) -> Result<Session, SessionError> {
        self.with_session(session_id, |session| {
            session.user_id = new_user_id.to_string();
            session.clone()
        })
    }

    async fn invalidate(&self, session_id: &str) -> Result<bool, SessionError> {
        let shard = self.shard(session_id)?;
        match shard.remove(session_id) {
            Some((_, session)) => Ok(!session.is_expired(Utc::now())),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ShardedSessionStore {
        ShardedSessionStore::new(8)
    }

    #[tokio::test]
    async fn test_create_get_invalidate() {
        let store = store();
        let mut data = Map::new();
        data.insert("client_id".to_string(), json!("demo-client"));
        let session = store
            .create("user-1", Duration::seconds(3600), data)
            .await
            .unwrap();
        assert!(session.id.starts_with(SESSION_ID_PREFIX));

        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "user-1");

        assert!(store.invalidate(&session.id).await.unwrap());
        assert!(store.get(&session.id).await.unwrap().is_none());
        // Second invalidate reports nothing was live.
        assert!(!store.invalidate(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_ids_rejected() {
        let store = store();
        let err = store.get("plain-old-session-id").await.unwrap_err();
        assert!(matches!(err, SessionError::LegacyId));
    }

    #[tokio::test]
    async fn test_extend_is_idempotent_and_capped() {
        let store = store();
        let session = store
            .create("user-1", Duration::seconds(600), Map::new())
            .await
            .unwrap();

        let extended = store
            .extend(&session.id, Duration::seconds(1200), Duration::hours(24))
            .await
            .unwrap();
        assert!(extended.expires_at > session.expires_at);

        // A shorter proposal never shrinks the expiry.
        let again = store
            .extend(&session.id, Duration::seconds(1), Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(again.expires_at, extended.expires_at);

        // And the cap wins over oversized proposals.
        let capped = store
            .extend(&session.id, Duration::days(30), Duration::hours(24))
            .await
            .unwrap();
        assert!(capped.expires_at <= Utc::now() + Duration::hours(24) + Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_update_data_patch_semantics() {
        let store = store();
        let mut data = Map::new();
        data.insert("upgrade_nonce".to_string(), json!("n-1"));
        data.insert("is_anonymous".to_string(), json!(true));
        let session = store
            .create("anon-1", Duration::seconds(600), data)
            .await
            .unwrap();
        assert!(session.is_anonymous());

        let mut patch = Map::new();
        patch.insert("upgrade_nonce".to_string(), Value::Null);
        patch.insert("is_anonymous".to_string(), json!(false));
        patch.insert("verified_email".to_string(), json!("a@example.com"));
        let updated = store.update_data(&session.id, patch).await.unwrap();

        assert!(!updated.is_anonymous());
        assert!(updated.data.get("upgrade_nonce").is_none());
        assert_eq!(
            updated.data.get("verified_email").and_then(|v| v.as_str()),
            Some("a@example.com")
        );
    }

    #[tokio::test]
    async fn test_update_user_for_upgrade() {
        let store = store();
        let session = store
            .create("anon-1", Duration::seconds(600), Map::new())
            .await
            .unwrap();
        let updated = store.update_user(&session.id, "user-9").await.unwrap();
        assert_eq!(updated.user_id, "user-9");
    }
}
