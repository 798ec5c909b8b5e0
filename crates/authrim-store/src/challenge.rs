//! Single-use, TTL-bounded challenge store.
//!
//! Holds every one-shot artifact: authorization codes, email OTP attempts,
//! passkey and DID nonces, anonymous device challenges, session-exchange
//! tokens, device-auth and CIBA requests. Consume is single-success across
//! concurrent callers; consumed authorization codes are retained until
//! expiry so a replay can surface the tokens it previously produced.

use crate::shard::{effective_shard, raw_shard};
use authrim_crypto::verify_pkce;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    AuthCode,
    EmailCode,
    PasskeyLogin,
    PasskeyRegister,
    DidRegistration,
    AnonLogin,
    SessionToken,
    DirectAuthCode,
    DeviceAuth,
    Ciba,
    LoginChallenge,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::AuthCode => "auth_code",
            ChallengeKind::EmailCode => "email_code",
            ChallengeKind::PasskeyLogin => "passkey_login",
            ChallengeKind::PasskeyRegister => "passkey_register",
            ChallengeKind::DidRegistration => "did_registration",
            ChallengeKind::AnonLogin => "anon_login",
            ChallengeKind::SessionToken => "session_token",
            ChallengeKind::DirectAuthCode => "direct_auth_code",
            ChallengeKind::DeviceAuth => "device_auth",
            ChallengeKind::Ciba => "ciba",
            ChallengeKind::LoginChallenge => "login_challenge",
        }
    }

    /// Consumed records of these kinds stay (marked) until expiry so replay
    /// attempts can be told apart from unknown ids.
    fn retains_consumed(&self) -> bool {
        matches!(self, ChallengeKind::AuthCode | ChallengeKind::DirectAuthCode)
    }
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Challenge not found")]
    NotFound,
    #[error("Challenge expired")]
    Expired,
    #[error("Challenge already consumed")]
    AlreadyConsumed {
        access_jti: Option<String>,
        refresh_jti: Option<String>,
    },
    #[error("Challenge predicate failed: {reason}")]
    PredicateMismatch { reason: String },
    #[error("PKCE verification failed")]
    PkceMismatch,
    #[error("Challenge bound to a different client")]
    ClientMismatch,
    #[error("Too many attempts")]
    TooManyAttempts,
    #[error("Challenge store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub kind: ChallengeKind,
    pub subject_id: Option<String>,
    /// Code or code-hash material, depending on kind.
    pub secret_material: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Value,
    pub consumed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: Option<u32>,
}

impl Challenge {
    pub fn new(kind: ChallengeKind, id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            subject_id: None,
            secret_material: None,
            created_at: now,
            expires_at: now + ttl,
            metadata: Value::Object(Default::default()),
            consumed_at: None,
            attempts: 0,
            max_attempts: None,
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_material = Some(secret.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Authorization-code payload carried in the challenge metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeData {
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    pub auth_time: i64,
    #[serde(default)]
    pub acr: Option<String>,
    #[serde(default)]
    pub amr: Option<Vec<String>>,
    #[serde(default)]
    pub dpop_jkt: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub authorization_details: Option<Value>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub issued_access_jti: Option<String>,
    #[serde(default)]
    pub issued_refresh_jti: Option<String>,
}

type Predicate<'a> = &'a (dyn Fn(&Challenge) -> Result<(), ChallengeError> + Sync);

#[async_trait::async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn store(&self, challenge: Challenge) -> Result<(), ChallengeError>;

    /// Non-destructive read.
    async fn get(&self, kind: ChallengeKind, id: &str) -> Result<Option<Challenge>, ChallengeError>;

    /// Single-success consume: exactly one concurrent caller observes the
    /// record; the rest observe `AlreadyConsumed` (or `NotFound` once the
    /// record is gone). A failing predicate leaves the record in place but
    /// counts an attempt where the kind caps attempts.
    async fn consume(
        &self,
        kind: ChallengeKind,
        id: &str,
        predicate: Option<Predicate<'_>>,
    ) -> Result<Challenge, ChallengeError>;

    /// Atomic read-modify-write on a live or consumed record.
    async fn update(
        &self,
        kind: ChallengeKind,
        id: &str,
        mutate: &(dyn for<'a> Fn(&'a mut Challenge) -> Result<(), ChallengeError> + Sync),
    ) -> Result<Challenge, ChallengeError>;

    async fn delete(&self, kind: ChallengeKind, id: &str) -> Result<(), ChallengeError>;

    /// Authorization-code consume: PKCE and client binding checked inside
    /// the consume critical section; a replay surfaces the previously
    /// registered token identifiers.
    async fn consume_auth_code(
        &self,
        code: &str,
        client_id: &str,
        code_verifier: &str,
    ) -> Result<AuthCodeData, ChallengeError> {
        let client_id = client_id.to_string();
        let code_verifier = code_verifier.to_string();
        let predicate = move |challenge: &Challenge| -> Result<(), ChallengeError> {
            let data: AuthCodeData = serde_json::from_value(challenge.metadata.clone())
                .map_err(|e| ChallengeError::StoreUnavailable(e.to_string()))?;
            if data.client_id != client_id {
                return Err(ChallengeError::ClientMismatch);
            }
            if data.code_challenge_method != "S256"
                || !verify_pkce(&code_verifier, &data.code_challenge)
            {
                return Err(ChallengeError::PkceMismatch);
            }
            Ok(())
        };
        let consumed = self
            .consume(ChallengeKind::AuthCode, code, Some(&predicate))
            .await?;
        serde_json::from_value(consumed.metadata)
            .map_err(|e| ChallengeError::StoreUnavailable(e.to_string()))
    }

    /// Arm the replay-revocation path on a freshly consumed code.
    async fn register_issued_tokens(
        &self,
        code: &str,
        access_jti: &str,
        refresh_jti: Option<&str>,
    ) -> Result<(), ChallengeError> {
        let access_jti = access_jti.to_string();
        let refresh_jti = refresh_jti.map(String::from);
        self.update(ChallengeKind::AuthCode, code, &move |challenge| {
            let obj = challenge
                .metadata
                .as_object_mut()
                .ok_or_else(|| ChallengeError::StoreUnavailable("malformed metadata".into()))?;
            obj.insert("issued_access_jti".to_string(), Value::String(access_jti.clone()));
            if let Some(jti) = &refresh_jti {
                obj.insert("issued_refresh_jti".to_string(), Value::String(jti.clone()));
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }
}

/// In-process sharded implementation. Shard routing hashes the challenge id;
/// producers key subject-scoped kinds (email codes, passkey nonces) and
/// device-scoped kinds (anonymous login) by subject or device-hash id, so
/// the id hash is the shard function for every kind.
pub struct ShardedChallengeStore {
    shards: Vec<DashMap<String, Challenge>>,
}

impl ShardedChallengeStore {
    pub fn new(shard_count: u32) -> Self {
        let count = shard_count.max(1) as usize;
        Self {
            shards: (0..count).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, id: &str) -> &DashMap<String, Challenge> {
        let idx = effective_shard(raw_shard(id), self.shards.len() as u32) as usize;
        &self.shards[idx]
    }

    fn entry_key(kind: ChallengeKind, id: &str) -> String {
        format!("{}:{}", kind.as_str(), id)
    }

    /// Drop expired records. Lazy expiry already hides them; this reclaims
    /// memory on a sweep schedule.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        for shard in &self.shards {
            let before = shard.len();
            shard.retain(|_, c| !c.is_expired(now));
            purged += before - shard.len();
        }
        purged
    }
}

#[async_trait::async_trait]
impl ChallengeStore for ShardedChallengeStore {
    async fn store(&self, challenge: Challenge) -> Result<(), ChallengeError> {
        let key = Self::entry_key(challenge.kind, &challenge.id);
        self.shard(&challenge.id).insert(key, challenge);
        Ok(())
    }

    async fn get(&self, kind: ChallengeKind, id: &str) -> Result<Option<Challenge>, ChallengeError> {
        let key = Self::entry_key(kind, id);
        let now = Utc::now();
        match self.shard(id).get(&key) {
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn consume(
        &self,
        kind: ChallengeKind,
        id: &str,
        predicate: Option<Predicate<'_>>,
    ) -> Result<Challenge, ChallengeError> {
        let key = Self::entry_key(kind, id);
        let now = Utc::now();
        let shard = self.shard(id);

        // The entry holds the map shard's write lock for the whole
        // check-and-mark, which is what makes consume single-success.
        let mut entry = match shard.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => e,
            dashmap::mapref::entry::Entry::Vacant(_) => return Err(ChallengeError::NotFound),
        };

        if entry.get().is_expired(now) {
            entry.remove();
            return Err(ChallengeError::Expired);
        }

        if entry.get().consumed_at.is_some() {
            let meta = &entry.get().metadata;
            return Err(ChallengeError::AlreadyConsumed {
                access_jti: meta
                    .get("issued_access_jti")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                refresh_jti: meta
                    .get("issued_refresh_jti")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            });
        }

        if let Some(predicate) = predicate {
            if let Err(err) = predicate(entry.get()) {
                let record = entry.get_mut();
                record.attempts += 1;
                if let Some(max) = record.max_attempts {
                    if record.attempts >= max {
                        entry.remove();
                        return Err(ChallengeError::TooManyAttempts);
                    }
                }
                return Err(err);
            }
        }

        if kind.retains_consumed() {
            let record = entry.get_mut();
            record.consumed_at = Some(now);
            Ok(record.clone())
        } else {
            Ok(entry.remove())
        }
    }

    async fn update(
        &self,
        kind: ChallengeKind,
        id: &str,
        mutate: &(dyn for<'a> Fn(&'a mut Challenge) -> Result<(), ChallengeError> + Sync),
    ) -> Result<Challenge, ChallengeError> {
        let key = Self::entry_key(kind, id);
        let shard = self.shard(id);
        let mut entry = match shard.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => e,
            dashmap::mapref::entry::Entry::Vacant(_) => return Err(ChallengeError::NotFound),
        };
        if entry.get().is_expired(Utc::now()) {
            entry.remove();
            return Err(ChallengeError::Expired);
        }
        mutate(entry.get_mut())?;
        Ok(entry.get().clone())
    }

    async fn delete(&self, kind: ChallengeKind, id: &str) -> Result<(), ChallengeError> {
        let key = Self::entry_key(kind, id);
        self.shard(id).remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_crypto::s256;
    use std::sync::Arc;

    fn auth_code_challenge(code: &str, verifier: &str) -> Challenge {
        let data = AuthCodeData {
            user_id: "user-1".into(),
            client_id: "demo-client".into(),
            scope: "openid profile".into(),
            redirect_uri: "https://rp.example/cb".into(),
            nonce: None,
            state: None,
            auth_time: Utc::now().timestamp(),
            acr: None,
            amr: None,
            dpop_jkt: None,
            sid: Some("sess_00_x".into()),
            authorization_details: None,
            code_challenge: s256(verifier),
            code_challenge_method: "S256".into(),
            anonymous: false,
            issued_access_jti: None,
            issued_refresh_jti: None,
        };
        Challenge::new(ChallengeKind::AuthCode, code, Duration::seconds(600))
            .with_subject("user-1")
            .with_metadata(serde_json::to_value(data).unwrap())
    }

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    #[tokio::test]
    async fn test_consume_is_single_success() {
        let store = Arc::new(ShardedChallengeStore::new(4));
        store.store(auth_code_challenge("c1", VERIFIER)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.consume_auth_code("c1", "demo-client", VERIFIER).await
            }));
        }

        let mut successes = 0;
        let mut replays = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(ChallengeError::AlreadyConsumed { .. }) => replays += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(replays, 15);
    }

    #[tokio::test]
    async fn test_replay_surfaces_registered_jtis() {
        let store = ShardedChallengeStore::new(4);
        store.store(auth_code_challenge("c2", VERIFIER)).await.unwrap();

        store
            .consume_auth_code("c2", "demo-client", VERIFIER)
            .await
            .unwrap();
        store
            .register_issued_tokens("c2", "at-jti-1", Some("rt-jti-1"))
            .await
            .unwrap();

        let err = store
            .consume_auth_code("c2", "demo-client", VERIFIER)
            .await
            .unwrap_err();
        match err {
            ChallengeError::AlreadyConsumed {
                access_jti,
                refresh_jti,
            } => {
                assert_eq!(access_jti.as_deref(), Some("at-jti-1"));
                assert_eq!(refresh_jti.as_deref(), Some("rt-jti-1"));
            }
            other => panic!("expected AlreadyConsumed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_pkce_mismatch_does_not_consume() {
        let store = ShardedChallengeStore::new(4);
        store.store(auth_code_challenge("c3", VERIFIER)).await.unwrap();

        let wrong = "wrong-verifier-wrong-verifier-wrong-verifier-wrong";
        let err = store
            .consume_auth_code("c3", "demo-client", wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::PkceMismatch));

        // The record survives a failed predicate; the right verifier wins.
        store
            .consume_auth_code("c3", "demo-client", VERIFIER)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_binding() {
        let store = ShardedChallengeStore::new(4);
        store.store(auth_code_challenge("c4", VERIFIER)).await.unwrap();
        let err = store
            .consume_auth_code("c4", "other-client", VERIFIER)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::ClientMismatch));
    }

    #[tokio::test]
    async fn test_expired_challenge_is_gone() {
        let store = ShardedChallengeStore::new(4);
        let mut challenge = auth_code_challenge("c5", VERIFIER);
        challenge.expires_at = Utc::now() - Duration::seconds(1);
        store.store(challenge).await.unwrap();

        assert!(store.get(ChallengeKind::AuthCode, "c5").await.unwrap().is_none());
        let err = store
            .consume_auth_code("c5", "demo-client", VERIFIER)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::Expired));
    }

    #[tokio::test]
    async fn test_email_code_attempt_cap() {
        let store = ShardedChallengeStore::new(4);
        let challenge = Challenge::new(ChallengeKind::EmailCode, "user-7", Duration::seconds(600))
            .with_secret(s256("123456"))
            .with_max_attempts(5);
        store.store(challenge).await.unwrap();

        let wrong_guess = |guess: &'static str| {
            move |c: &Challenge| -> Result<(), ChallengeError> {
                if c.secret_material.as_deref() == Some(s256(guess).as_str()) {
                    Ok(())
                } else {
                    Err(ChallengeError::PredicateMismatch {
                        reason: "code mismatch".into(),
                    })
                }
            }
        };

        for _ in 0..4 {
            let err = store
                .consume(ChallengeKind::EmailCode, "user-7", Some(&wrong_guess("000000")))
                .await
                .unwrap_err();
            assert!(matches!(err, ChallengeError::PredicateMismatch { .. }));
        }
        // Fifth bad attempt destroys the code.
        let err = store
            .consume(ChallengeKind::EmailCode, "user-7", Some(&wrong_guess("000000")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::TooManyAttempts));

        let err = store
            .consume(ChallengeKind::EmailCode, "user-7", Some(&wrong_guess("123456")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::NotFound));
    }

    #[tokio::test]
    async fn test_non_auth_code_kinds_are_removed_on_consume() {
        let store = ShardedChallengeStore::new(4);
        let challenge =
            Challenge::new(ChallengeKind::PasskeyLogin, "nonce-1", Duration::seconds(120));
        store.store(challenge).await.unwrap();

        store
            .consume(ChallengeKind::PasskeyLogin, "nonce-1", None)
            .await
            .unwrap();
        let err = store
            .consume(ChallengeKind::PasskeyLogin, "nonce-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeError::NotFound));
    }
}
