//! Refresh-token families: one healthy head per (user, client), a monotonic
//! rotation version, and family-wide revocation on any stale presentation.
//!
//! The refresh JTI encodes `generation|shard|random` so any holder of the
//! JWT routes straight to the owning shard; generations allow scale-out
//! without migrating live families.

use crate::shard::{effective_shard, raw_shard};
use authrim_crypto::random_token;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub mod revocation_reasons {
    pub const THEFT_DETECTED: &str = "theft_detected";
    pub const SUPERSEDED: &str = "superseded";
    pub const AUTH_CODE_REPLAY: &str = "auth_code_replay";
    pub const USER_LOGOUT: &str = "user_logout";
    pub const ADMIN: &str = "admin_revoked";
}

#[derive(Debug, Error)]
pub enum RefreshFamilyError {
    #[error("Refresh family not found")]
    FamilyNotFound,
    #[error("Refresh family already exists")]
    FamilyExists,
    #[error("Refresh family revoked: {reason}")]
    FamilyRevoked { reason: String },
    #[error("Refresh token reuse detected")]
    TheftDetected,
    #[error("Requested scope exceeds the family scope")]
    ScopeWidening,
    #[error("Malformed refresh token id")]
    MalformedJti,
    #[error("Refresh family store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshJti {
    pub generation: u32,
    pub shard_index: u32,
    pub random: String,
}

pub fn encode_refresh_jti(generation: u32, shard_index: u32, random: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{generation}|{shard_index:04}|{random}"))
}

pub fn decode_refresh_jti(jti: &str) -> Result<RefreshJti, RefreshFamilyError> {
    let raw = URL_SAFE_NO_PAD
        .decode(jti)
        .map_err(|_| RefreshFamilyError::MalformedJti)?;
    let raw = String::from_utf8(raw).map_err(|_| RefreshFamilyError::MalformedJti)?;
    let mut parts = raw.splitn(3, '|');
    let generation = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(RefreshFamilyError::MalformedJti)?;
    let shard_index = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(RefreshFamilyError::MalformedJti)?;
    let random = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or(RefreshFamilyError::MalformedJti)?
        .to_string();
    Ok(RefreshJti {
        generation,
        shard_index,
        random,
    })
}

fn new_head_jti(generation: u32, shard_index: u32) -> String {
    encode_refresh_jti(generation, shard_index, &random_token(16))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub user_id: String,
    pub client_id: String,
    pub generation: u32,
    pub shard_index: u32,
    pub head_version: u32,
    pub head_jti: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: Option<RevokedInfo>,
}

#[derive(Debug, Clone)]
pub struct FamilyHead {
    pub version: u32,
    pub jti: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

/// Best-effort flat index of family heads keyed by user, for user-wide
/// admin revocation. Writes are fire-and-forget.
#[async_trait::async_trait]
pub trait FamilyMirror: Send + Sync {
    async fn record_head(
        &self,
        user_id: &str,
        client_id: &str,
        jti: &str,
        generation: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String>;
    async fn list_user_heads(&self, user_id: &str) -> Result<Vec<(String, String)>, String>;
    async fn remove_head(&self, jti: &str) -> Result<(), String>;
}

pub struct NoopFamilyMirror;

#[async_trait::async_trait]
impl FamilyMirror for NoopFamilyMirror {
    async fn record_head(
        &self,
        _user_id: &str,
        _client_id: &str,
        _jti: &str,
        _generation: u32,
        _expires_at: DateTime<Utc>,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn list_user_heads(&self, _user_id: &str) -> Result<Vec<(String, String)>, String> {
        Ok(Vec::new())
    }

    async fn remove_head(&self, _jti: &str) -> Result<(), String> {
        Ok(())
    }
}

pub struct RefreshFamilyManager {
    shards: Vec<DashMap<String, FamilyRecord>>,
    current_generation: u32,
    mirror: Arc<dyn FamilyMirror>,
}

impl RefreshFamilyManager {
    pub fn new(shard_count: u32, current_generation: u32, mirror: Arc<dyn FamilyMirror>) -> Self {
        let count = shard_count.max(1) as usize;
        Self {
            shards: (0..count).map(|_| DashMap::new()).collect(),
            current_generation,
            mirror,
        }
    }

    pub fn current_generation(&self) -> u32 {
        self.current_generation
    }

    fn shard(&self, shard_index: u32) -> &DashMap<String, FamilyRecord> {
        let idx = effective_shard(shard_index, self.shards.len() as u32) as usize;
        &self.shards[idx]
    }

    fn family_key(user_id: &str, client_id: &str, generation: u32) -> String {
        format!("{user_id}\u{1f}{client_id}\u{1f}{generation}")
    }

    fn shard_index_for(&self, user_id: &str, client_id: &str) -> u32 {
        effective_shard(
            raw_shard(&format!("{user_id}:{client_id}")),
            self.shards.len() as u32,
        )
    }

    fn mirror_head(&self, record: &FamilyRecord) {
        let mirror = self.mirror.clone();
        let (user, client, jti, generation, expires_at) = (
            record.user_id.clone(),
            record.client_id.clone(),
            record.head_jti.clone(),
            record.generation,
            record.expires_at,
        );
        tokio::spawn(async move {
            if let Err(e) = mirror
                .record_head(&user, &client, &jti, generation, expires_at)
                .await
            {
                warn!(user_id = %user, error = %e, "family mirror write failed");
            }
        });
    }

    /// Start a family at version 1. Fails when a healthy head already
    /// exists for (user, client); callers that intend replacement use
    /// [`replace_family`](Self::replace_family).
    pub fn create_family(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        ttl: Duration,
    ) -> Result<FamilyHead, RefreshFamilyError> {
        let generation = self.current_generation;
        let shard_index = self.shard_index_for(user_id, client_id);
        let key = Self::family_key(user_id, client_id, generation);
        let shard = self.shard(shard_index);

        let now = Utc::now();
        let mut entry = shard.entry(key).or_insert_with(|| FamilyRecord {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            generation,
            shard_index,
            head_version: 0,
            head_jti: String::new(),
            scope: scope.to_string(),
            expires_at: now,
            revoked: None,
        });

        let record = entry.value_mut();
        let healthy = record.head_version > 0 && record.revoked.is_none() && record.expires_at > now;
        if healthy {
            return Err(RefreshFamilyError::FamilyExists);
        }

        record.head_version = 1;
        record.head_jti = new_head_jti(generation, shard_index);
        record.scope = scope.to_string();
        record.expires_at = now + ttl;
        record.revoked = None;

        let head = FamilyHead {
            version: 1,
            jti: record.head_jti.clone(),
            scope: record.scope.clone(),
            expires_at: record.expires_at,
        };
        let snapshot = record.clone();
        drop(entry);
        self.mirror_head(&snapshot);
        Ok(head)
    }

    /// Revoke any healthy head for (user, client) with reason `superseded`
    /// and start a fresh family. The normal path for a new login.
    pub fn replace_family(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        ttl: Duration,
    ) -> Result<FamilyHead, RefreshFamilyError> {
        self.revoke(user_id, client_id, revocation_reasons::SUPERSEDED);
        match self.create_family(user_id, client_id, scope, ttl) {
            Err(RefreshFamilyError::FamilyExists) => {
                // Lost a race with a concurrent login; that head stands.
                self.head(user_id, client_id)
                    .ok_or(RefreshFamilyError::FamilyNotFound)
            }
            other => other,
        }
    }

    /// Rotate the head. The presented (version, jti) must both match the
    /// head exactly; any mismatch revokes the whole family (theft
    /// detection). Scope may only narrow.
    pub fn rotate(
        &self,
        incoming_version: u32,
        incoming_jti: &str,
        user_id: &str,
        client_id: &str,
        requested_scope: Option<&str>,
    ) -> Result<FamilyHead, RefreshFamilyError> {
        let routed = decode_refresh_jti(incoming_jti)?;
        let key = Self::family_key(user_id, client_id, routed.generation);
        let shard = self.shard(routed.shard_index);

        let mut entry = match shard.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => e,
            dashmap::mapref::entry::Entry::Vacant(_) => {
                return Err(RefreshFamilyError::FamilyNotFound)
            }
        };
        let record = entry.get_mut();

        if let Some(revoked) = &record.revoked {
            return Err(RefreshFamilyError::FamilyRevoked {
                reason: revoked.reason.clone(),
            });
        }
        let now = Utc::now();
        if record.expires_at <= now {
            entry.remove();
            return Err(RefreshFamilyError::FamilyNotFound);
        }

        if incoming_version != record.head_version || incoming_jti != record.head_jti {
            record.revoked = Some(RevokedInfo {
                reason: revocation_reasons::THEFT_DETECTED.to_string(),
                at: now,
            });
            return Err(RefreshFamilyError::TheftDetected);
        }

        let granted_scope = match requested_scope {
            Some(requested) => {
                let stored: Vec<&str> = record.scope.split_whitespace().collect();
                let narrowed: Vec<&str> = requested.split_whitespace().collect();
                if narrowed.iter().any(|s| !stored.contains(s)) {
                    return Err(RefreshFamilyError::ScopeWidening);
                }
                narrowed.join(" ")
            }
            None => record.scope.clone(),
        };

        record.head_version += 1;
        record.head_jti = new_head_jti(record.generation, record.shard_index);

        let head = FamilyHead {
            version: record.head_version,
            jti: record.head_jti.clone(),
            scope: granted_scope,
            expires_at: record.expires_at,
        };
        let snapshot = record.clone();
        drop(entry);
        self.mirror_head(&snapshot);
        Ok(head)
    }

    /// Administrative force-revocation across all generations.
    pub fn revoke(&self, user_id: &str, client_id: &str, reason: &str) -> usize {
        let prefix = format!("{user_id}\u{1f}{client_id}\u{1f}");
        let now = Utc::now();
        let mut revoked = 0;
        for shard in &self.shards {
            for mut entry in shard.iter_mut() {
                if entry.key().starts_with(&prefix) && entry.value().revoked.is_none() {
                    entry.value_mut().revoked = Some(RevokedInfo {
                        reason: reason.to_string(),
                        at: now,
                    });
                    revoked += 1;
                }
            }
        }
        revoked
    }

    /// User-wide revocation (admin operation backed by the flat mirror in
    /// durable deployments; scans shards in-process).
    pub fn revoke_all_for_user(&self, user_id: &str, reason: &str) -> usize {
        let prefix = format!("{user_id}\u{1f}");
        let now = Utc::now();
        let mut revoked = 0;
        for shard in &self.shards {
            for mut entry in shard.iter_mut() {
                if entry.key().starts_with(&prefix) && entry.value().revoked.is_none() {
                    entry.value_mut().revoked = Some(RevokedInfo {
                        reason: reason.to_string(),
                        at: now,
                    });
                    revoked += 1;
                }
            }
        }
        revoked
    }

    /// Current healthy head for (user, client) in the current generation.
    pub fn head(&self, user_id: &str, client_id: &str) -> Option<FamilyHead> {
        let shard_index = self.shard_index_for(user_id, client_id);
        let key = Self::family_key(user_id, client_id, self.current_generation);
        let record = self.shard(shard_index).get(&key)?;
        if record.revoked.is_some() || record.expires_at <= Utc::now() {
            return None;
        }
        Some(FamilyHead {
            version: record.head_version,
            jti: record.head_jti.clone(),
            scope: record.scope.clone(),
            expires_at: record.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RefreshFamilyManager {
        RefreshFamilyManager::new(16, 1, Arc::new(NoopFamilyMirror))
    }

    #[tokio::test]
    async fn test_jti_layout_round_trip() {
        let jti = encode_refresh_jti(3, 12, "abcdef");
        let decoded = decode_refresh_jti(&jti).unwrap();
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.shard_index, 12);
        assert_eq!(decoded.random, "abcdef");

        assert!(decode_refresh_jti("!!!not-base64!!!").is_err());
    }

    #[tokio::test]
    async fn test_create_then_rotate_increments_version() {
        let mgr = manager();
        let head = mgr
            .create_family("user-1", "client-1", "openid profile", Duration::days(30))
            .unwrap();
        assert_eq!(head.version, 1);

        let rotated = mgr
            .rotate(head.version, &head.jti, "user-1", "client-1", None)
            .unwrap();
        assert_eq!(rotated.version, 2);
        assert_ne!(rotated.jti, head.jti);
    }

    #[tokio::test]
    async fn test_second_create_fails_and_replace_supersedes() {
        let mgr = manager();
        let first = mgr
            .create_family("user-1", "client-1", "openid", Duration::days(30))
            .unwrap();
        assert!(matches!(
            mgr.create_family("user-1", "client-1", "openid", Duration::days(30)),
            Err(RefreshFamilyError::FamilyExists)
        ));

        let second = mgr
            .replace_family("user-1", "client-1", "openid", Duration::days(30))
            .unwrap();
        assert_eq!(second.version, 1);

        // The superseded head no longer rotates.
        let err = mgr
            .rotate(first.version, &first.jti, "user-1", "client-1", None)
            .unwrap_err();
        assert!(matches!(err, RefreshFamilyError::TheftDetected));
    }

    #[tokio::test]
    async fn test_stale_rotation_revokes_family() {
        let mgr = manager();
        let v1 = mgr
            .create_family("user-1", "client-1", "openid", Duration::days(30))
            .unwrap();
        let v2 = mgr
            .rotate(v1.version, &v1.jti, "user-1", "client-1", None)
            .unwrap();

        // Holder B replays the original token.
        let err = mgr
            .rotate(v1.version, &v1.jti, "user-1", "client-1", None)
            .unwrap_err();
        assert!(matches!(err, RefreshFamilyError::TheftDetected));

        // Holder A's current token is now dead too.
        let err = mgr
            .rotate(v2.version, &v2.jti, "user-1", "client-1", None)
            .unwrap_err();
        assert!(matches!(err, RefreshFamilyError::FamilyRevoked { reason } if reason == revocation_reasons::THEFT_DETECTED));
    }

    #[tokio::test]
    async fn test_concurrent_rotation_single_winner() {
        let mgr = Arc::new(manager());
        let head = mgr
            .create_family("user-1", "client-1", "openid", Duration::days(30))
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let jti = head.jti.clone();
            handles.push(tokio::spawn(async move {
                mgr.rotate(1, &jti, "user-1", "client-1", None)
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_scope_narrowing_allowed_widening_rejected() {
        let mgr = manager();
        let head = mgr
            .create_family("user-1", "client-1", "openid profile email", Duration::days(30))
            .unwrap();

        let narrowed = mgr
            .rotate(head.version, &head.jti, "user-1", "client-1", Some("openid email"))
            .unwrap();
        assert_eq!(narrowed.scope, "openid email");

        let err = mgr
            .rotate(
                narrowed.version,
                &narrowed.jti,
                "user-1",
                "client-1",
                Some("openid admin"),
            )
            .unwrap_err();
        assert!(matches!(err, RefreshFamilyError::ScopeWidening));
    }

    #[tokio::test]
    async fn test_unknown_family_not_found() {
        let mgr = manager();
        let jti = encode_refresh_jti(1, 3, "zzz");
        let err = mgr
            .rotate(1, &jti, "ghost", "client-1", None)
            .unwrap_err();
        assert!(matches!(err, RefreshFamilyError::FamilyNotFound));
    }

    proptest::proptest! {
        // Any (generation, shard, random) triple survives the JTI encoding.
        #[test]
        fn prop_jti_layout_round_trip(
            generation in 0u32..1000,
            shard in 0u32..4096,
            random in "[A-Za-z0-9_-]{8,32}",
        ) {
            let jti = encode_refresh_jti(generation, shard, &random);
            let decoded = decode_refresh_jti(&jti).unwrap();
            proptest::prop_assert_eq!(decoded.generation, generation);
            proptest::prop_assert_eq!(decoded.shard_index, shard);
            proptest::prop_assert_eq!(decoded.random, random);
        }
    }

    #[tokio::test]
    async fn test_admin_revoke_all_for_user() {
        let mgr = manager();
        mgr.create_family("user-1", "client-a", "openid", Duration::days(30))
            .unwrap();
        mgr.create_family("user-1", "client-b", "openid", Duration::days(30))
            .unwrap();
        mgr.create_family("user-2", "client-a", "openid", Duration::days(30))
            .unwrap();

        assert_eq!(mgr.revoke_all_for_user("user-1", revocation_reasons::ADMIN), 2);
        assert!(mgr.head("user-1", "client-a").is_none());
        assert!(mgr.head("user-2", "client-a").is_some());
    }
}
