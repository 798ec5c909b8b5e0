//! JTI revocation index with TTL = remaining token lifetime.
//!
//! Access-token JTIs are region-aware: `{shard:02x}-{random}` routes a
//! lookup to the owning shard without a central index, and old JTIs keep
//! routing after a shard scale-out.

use crate::shard::{effective_shard, raw_shard};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("Revocation store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Safety margin past the original token expiry.
const EXPIRY_MARGIN: Duration = Duration::seconds(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub jti: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

/// Mint a region-sharded access-token JTI.
pub fn new_access_jti(shard_count: u32) -> String {
    let random = Uuid::new_v4().simple().to_string();
    let shard = effective_shard(raw_shard(&random), shard_count.max(1));
    format!("{shard:02x}-{random}")
}

/// Shard routing for a JTI: the embedded prefix when present, a stable
/// hash otherwise (refresh JTIs and foreign identifiers).
fn route(jti: &str) -> u32 {
    match jti.split_once('-').and_then(|(p, _)| u32::from_str_radix(p, 16).ok()) {
        Some(shard) => shard,
        None => raw_shard(jti),
    }
}

#[async_trait::async_trait]
pub trait TokenRevocationIndex: Send + Sync {
    async fn revoke(&self, jti: &str, ttl: Duration, reason: &str) -> Result<(), RevocationError>;
    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationError>;
    async fn entry(&self, jti: &str) -> Result<Option<RevocationEntry>, RevocationError>;
}

pub struct ShardedRevocationIndex {
    shards: Vec<DashMap<String, RevocationEntry>>,
}

impl ShardedRevocationIndex {
    pub fn new(shard_count: u32) -> Self {
        let count = shard_count.max(1) as usize;
        Self {
            shards: (0..count).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, jti: &str) -> &DashMap<String, RevocationEntry> {
        let idx = effective_shard(route(jti), self.shards.len() as u32) as usize;
        &self.shards[idx]
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        for shard in &self.shards {
            let before = shard.len();
            shard.retain(|_, e| e.expires_at > now);
            purged += before - shard.len();
        }
        purged
    }
}

#[async_trait::async_trait]
impl TokenRevocationIndex for ShardedRevocationIndex {
    async fn revoke(&self, jti: &str, ttl: Duration, reason: &str) -> Result<(), RevocationError> {
        let now = Utc::now();
        let entry = RevocationEntry {
            jti: jti.to_string(),
            revoked_at: now,
            expires_at: now + ttl + EXPIRY_MARGIN,
            reason: reason.to_string(),
        };
        self.shard(jti).insert(jti.to_string(), entry);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationError> {
        Ok(self.entry(jti).await?.is_some())
    }

    async fn entry(&self, jti: &str) -> Result<Option<RevocationEntry>, RevocationError> {
        let shard = self.shard(jti);
        match shard.get(jti) {
            Some(e) if e.expires_at > Utc::now() => Ok(Some(e.clone())),
            Some(_) => {
                shard.remove(jti);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revoke_and_lookup() {
        let index = ShardedRevocationIndex::new(16);
        let jti = new_access_jti(16);
        assert!(!index.is_revoked(&jti).await.unwrap());

        index
            .revoke(&jti, Duration::seconds(900), "auth_code_replay")
            .await
            .unwrap();
        assert!(index.is_revoked(&jti).await.unwrap());
        let entry = index.entry(&jti).await.unwrap().unwrap();
        assert_eq!(entry.reason, "auth_code_replay");
    }

    #[tokio::test]
    async fn test_expired_entries_fall_out() {
        let index = ShardedRevocationIndex::new(4);
        index
            .revoke("00-dead", Duration::seconds(-120), "test")
            .await
            .unwrap();
        assert!(!index.is_revoked("00-dead").await.unwrap());
    }

    #[tokio::test]
    async fn test_old_jtis_route_after_scale_out() {
        // A JTI minted with 4 shards still resolves in a 16-shard index.
        let jti = new_access_jti(4);
        let index = ShardedRevocationIndex::new(16);
        index.revoke(&jti, Duration::seconds(60), "test").await.unwrap();
        assert!(index.is_revoked(&jti).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_region_jtis_still_work() {
        let index = ShardedRevocationIndex::new(8);
        index
            .revoke("opaque-refresh-jti", Duration::seconds(60), "test")
            .await
            .unwrap();
        assert!(index.is_revoked("opaque-refresh-jti").await.unwrap());
    }
}
