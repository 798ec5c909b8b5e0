//! Short-TTL replay windows: DPoP proof `jti`s (per client) and Native SSO
//! exchange `jti`s.

use crate::shard::{effective_shard, raw_shard};
use authrim_crypto::DpopReplayStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Insert-if-absent index with per-entry expiry.
pub struct JtiReplayIndex {
    shards: Vec<DashMap<String, DateTime<Utc>>>,
}

impl JtiReplayIndex {
    pub fn new(shard_count: u32) -> Self {
        let count = shard_count.max(1) as usize;
        Self {
            shards: (0..count).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, key: &str) -> &DashMap<String, DateTime<Utc>> {
        let idx = effective_shard(raw_shard(key), self.shards.len() as u32) as usize;
        &self.shards[idx]
    }

    /// Returns `true` when the key was fresh (and is now recorded for
    /// `ttl`).
    pub fn check_and_insert(&self, key: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        let deadline = now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(600));
        let shard = self.shard(key);
        match shard.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if *e.get() <= now {
                    e.insert(deadline);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(deadline);
                true
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        for shard in &self.shards {
            let before = shard.len();
            shard.retain(|_, deadline| *deadline > now);
            purged += before - shard.len();
        }
        purged
    }
}

/// Per-client DPoP replay window over the shared index.
pub struct ShardedDpopReplayStore {
    index: JtiReplayIndex,
}

impl ShardedDpopReplayStore {
    pub fn new(shard_count: u32) -> Self {
        Self {
            index: JtiReplayIndex::new(shard_count),
        }
    }
}

#[async_trait::async_trait]
impl DpopReplayStore for ShardedDpopReplayStore {
    async fn check_and_insert(
        &self,
        client_id: &str,
        jti: &str,
        ttl: Duration,
    ) -> Result<bool, String> {
        Ok(self.index.check_and_insert(&format!("dpop:{client_id}:{jti}"), ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_once() {
        let index = JtiReplayIndex::new(4);
        assert!(index.check_and_insert("a", Duration::from_secs(60)));
        assert!(!index.check_and_insert("a", Duration::from_secs(60)));
        assert!(index.check_and_insert("b", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_dpop_window_is_per_client() {
        let store = ShardedDpopReplayStore::new(4);
        assert!(store
            .check_and_insert("client-a", "jti-1", Duration::from_secs(60))
            .await
            .unwrap());
        // Same jti under a different client is a distinct window.
        assert!(store
            .check_and_insert("client-b", "jti-1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .check_and_insert("client-a", "jti-1", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
