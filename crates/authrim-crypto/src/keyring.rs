//! Signing-key management: active key lookup, rotation with overlap,
//! JWKS publication and `kid`-based verification-key resolution.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use ring::signature::KeyPair;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::hashing::jwk_thumbprint;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationError(String),
    #[error("Key loading failed: {0}")]
    LoadingError(String),
    #[error("Unknown key id")]
    UnknownKid,
    #[error("No active signing key")]
    NoActiveKey,
    #[error("Key store error: {0}")]
    StoreError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    RS256,
    ES256,
}

impl KeyAlgorithm {
    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            KeyAlgorithm::RS256 => Algorithm::RS256,
            KeyAlgorithm::ES256 => Algorithm::ES256,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::RS256 => "RS256",
            KeyAlgorithm::ES256 => "ES256",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Overlap,
    Retired,
}

/// A signing key plus its published public half.
///
/// Exactly one key in the store is `Active` at a time; `Overlap` keys stay in
/// the JWKS until their `not_after` passes, `Retired` keys are gone from the
/// JWKS but may still be referenced by old revocation records.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: KeyAlgorithm,
    pub public_jwk: serde_json::Value,
    pub not_before: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
    pub status: KeyStatus,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// Generate a fresh RSA-2048 RS256 key.
    pub fn generate_rs256() -> Result<Self, KeyError> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;
        let public = RsaPublicKey::from(&private);

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        let bare_jwk = json!({ "kty": "RSA", "n": n, "e": e });
        let kid = jwk_thumbprint(&bare_jwk).map_err(KeyError::GenerationError)?;

        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;

        let public_jwk = json!({
            "kty": "RSA", "n": n, "e": e,
            "kid": kid, "alg": "RS256", "use": "sig",
        });

        Ok(Self {
            kid,
            algorithm: KeyAlgorithm::RS256,
            public_jwk,
            not_before: Utc::now(),
            not_after: None,
            status: KeyStatus::Active,
            encoding_key,
            decoding_key,
        })
    }

    /// Generate a fresh P-256 ES256 key. Much cheaper than RSA generation;
    /// used for emergency rotation and in tests.
    pub fn generate_es256() -> Result<Self, KeyError> {
        let rng = ring::rand::SystemRandom::new();
        let alg = &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING;
        let pkcs8 = ring::signature::EcdsaKeyPair::generate_pkcs8(alg, &rng)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;
        let pair = ring::signature::EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;

        // Uncompressed point: 0x04 || x || y, 32 bytes each on P-256.
        let point = pair.public_key().as_ref();
        if point.len() != 65 || point[0] != 0x04 {
            return Err(KeyError::GenerationError(
                "unexpected EC public key encoding".to_string(),
            ));
        }
        let x = URL_SAFE_NO_PAD.encode(&point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&point[33..65]);
        let bare_jwk = json!({ "kty": "EC", "crv": "P-256", "x": x, "y": y });
        let kid = jwk_thumbprint(&bare_jwk).map_err(KeyError::GenerationError)?;

        let encoding_key = EncodingKey::from_ec_der(pkcs8.as_ref());
        let decoding_key = DecodingKey::from_ec_components(&x, &y)
            .map_err(|e| KeyError::GenerationError(e.to_string()))?;

        let public_jwk = json!({
            "kty": "EC", "crv": "P-256", "x": x, "y": y,
            "kid": kid, "alg": "ES256", "use": "sig",
        });

        Ok(Self {
            kid,
            algorithm: KeyAlgorithm::ES256,
            public_jwk,
            not_before: Utc::now(),
            not_after: None,
            status: KeyStatus::Active,
            encoding_key,
            decoding_key,
        })
    }

    /// Load an RS256 key from a PKCS#8 private PEM plus its public JWK
    /// (the environment-baked form: config ships the JWK so verification
    /// needs no store round-trip).
    pub fn from_rsa_pem(private_pem: &str, public_jwk: serde_json::Value) -> Result<Self, KeyError> {
        let n = public_jwk
            .get("n")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KeyError::LoadingError("JWK missing 'n'".to_string()))?
            .to_string();
        let e = public_jwk
            .get("e")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KeyError::LoadingError("JWK missing 'e'".to_string()))?
            .to_string();

        let kid = match public_jwk.get("kid").and_then(|v| v.as_str()) {
            Some(kid) => kid.to_string(),
            None => jwk_thumbprint(&json!({ "kty": "RSA", "n": n, "e": e }))
                .map_err(KeyError::LoadingError)?,
        };

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| KeyError::LoadingError(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|e| KeyError::LoadingError(e.to_string()))?;

        let mut jwk = public_jwk;
        if let Some(obj) = jwk.as_object_mut() {
            obj.insert("kid".to_string(), json!(kid));
            obj.entry("alg").or_insert(json!("RS256"));
            obj.entry("use").or_insert(json!("sig"));
        }

        Ok(Self {
            kid,
            algorithm: KeyAlgorithm::RS256,
            public_jwk: jwk,
            not_before: Utc::now(),
            not_after: None,
            status: KeyStatus::Active,
            encoding_key,
            decoding_key,
        })
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    fn in_overlap_window(&self, now: DateTime<Utc>) -> bool {
        match self.not_after {
            Some(t) => t > now,
            None => true,
        }
    }
}

/// Backing store for signing keys (collaborator; durable in production).
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SigningKey>, KeyError>;
    async fn put(&self, key: SigningKey) -> Result<(), KeyError>;
    async fn mark(
        &self,
        kid: &str,
        status: KeyStatus,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<(), KeyError>;
}

pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn load_all(&self) -> Result<Vec<SigningKey>, KeyError> {
        Ok(self.keys.read().await.values().cloned().collect())
    }

    async fn put(&self, key: SigningKey) -> Result<(), KeyError> {
        self.keys.write().await.insert(key.kid.clone(), key);
        Ok(())
    }

    async fn mark(
        &self,
        kid: &str,
        status: KeyStatus,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<(), KeyError> {
        let mut keys = self.keys.write().await;
        let key = keys.get_mut(kid).ok_or(KeyError::UnknownKid)?;
        key.status = status;
        key.not_after = not_after;
        Ok(())
    }
}

struct KeyCache {
    by_kid: HashMap<String, SigningKey>,
    active_kid: Option<String>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn empty() -> Self {
        Self {
            by_kid: HashMap::new(),
            active_kid: None,
            fetched_at: None,
        }
    }

    fn is_stale(&self, ttl: std::time::Duration) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() > ttl,
            None => true,
        }
    }
}

/// In-process view over the key store with a short-TTL signing cache and a
/// kid-invalidated verification cache.
pub struct KeyRing {
    store: Arc<dyn KeyStore>,
    cache: RwLock<KeyCache>,
    signing_cache_ttl: std::time::Duration,
}

impl KeyRing {
    pub fn new(store: Arc<dyn KeyStore>, signing_cache_ttl: std::time::Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(KeyCache::empty()),
            signing_cache_ttl,
        }
    }

    /// A ring seeded with a freshly generated ES256 key. Test construction.
    pub async fn new_for_testing() -> Result<Self, KeyError> {
        let store = Arc::new(InMemoryKeyStore::new());
        let key = SigningKey::generate_es256()?;
        store.put(key).await?;
        Ok(Self::new(store, std::time::Duration::from_secs(300)))
    }

    async fn refresh_cache(&self) -> Result<(), KeyError> {
        let keys = self.store.load_all().await?;
        let mut cache = self.cache.write().await;
        cache.by_kid.clear();
        cache.active_kid = None;
        for key in keys {
            if key.status == KeyStatus::Active {
                cache.active_kid = Some(key.kid.clone());
            }
            cache.by_kid.insert(key.kid.clone(), key);
        }
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }

    /// Currently active signing key. Callers must not hold the result beyond
    /// the signing cache TTL.
    pub async fn active_signing_key(&self) -> Result<SigningKey, KeyError> {
        self.active_signing_key_hinted(None).await
    }

    /// Like [`active_signing_key`], but a caller that already observed a
    /// `kid` (e.g. on an inbound token) may pass it: a hint matching the
    /// cached active key skips the TTL check.
    pub async fn active_signing_key_hinted(
        &self,
        kid_hint: Option<&str>,
    ) -> Result<SigningKey, KeyError> {
        {
            let cache = self.cache.read().await;
            if let Some(active) = cache.active_kid.as_deref() {
                let hint_matches = kid_hint.map(|h| h == active).unwrap_or(false);
                if hint_matches || !cache.is_stale(self.signing_cache_ttl) {
                    if let Some(key) = cache.by_kid.get(active) {
                        return Ok(key.clone());
                    }
                }
            }
        }
        self.refresh_cache().await?;
        let cache = self.cache.read().await;
        let kid = cache.active_kid.as_deref().ok_or(KeyError::NoActiveKey)?;
        cache.by_kid.get(kid).cloned().ok_or(KeyError::NoActiveKey)
    }

    /// Verification key for `kid`, or the active key when absent. A `kid`
    /// miss invalidates the cache and refetches once so emergency rotation
    /// (overlap window 0) is observed immediately; still-unknown kids fail
    /// with [`KeyError::UnknownKid`] and must never be echoed to callers.
    pub async fn verification_key(&self, kid: Option<&str>) -> Result<SigningKey, KeyError> {
        let kid = match kid {
            Some(kid) => kid.to_string(),
            None => return self.active_signing_key().await,
        };

        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.by_kid.get(&kid) {
                return Ok(key.clone());
            }
        }

        self.refresh_cache().await?;
        let cache = self.cache.read().await;
        cache.by_kid.get(&kid).cloned().ok_or(KeyError::UnknownKid)
    }

    /// Public JWK set: active and in-window overlap keys.
    pub async fn jwks(&self) -> Result<serde_json::Value, KeyError> {
        if self.cache.read().await.is_stale(self.signing_cache_ttl) {
            self.refresh_cache().await?;
        }
        let now = Utc::now();
        let cache = self.cache.read().await;
        let mut keys: Vec<serde_json::Value> = cache
            .by_kid
            .values()
            .filter(|k| match k.status {
                KeyStatus::Active => true,
                KeyStatus::Overlap => k.in_overlap_window(now),
                KeyStatus::Retired => false,
            })
            .map(|k| k.public_jwk.clone())
            .collect();
        keys.sort_by_key(|k| {
            k.get("kid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        });
        Ok(json!({ "keys": keys }))
    }

    /// Install a new active key, demoting the previous active key to overlap
    /// for `overlap_window` (zero = emergency rotation, the old key leaves
    /// the JWKS at once).
    pub async fn rotate(
        &self,
        new_key: SigningKey,
        overlap_window: Duration,
    ) -> Result<SigningKey, KeyError> {
        let previous = {
            let cache = self.cache.read().await;
            cache.active_kid.clone()
        };

        if let Some(prev_kid) = previous {
            if prev_kid != new_key.kid {
                let (status, not_after) = if overlap_window.is_zero() {
                    (KeyStatus::Retired, Some(Utc::now()))
                } else {
                    (KeyStatus::Overlap, Some(Utc::now() + overlap_window))
                };
                self.store.mark(&prev_kid, status, not_after).await?;
            }
        }

        self.store.put(new_key.clone()).await?;
        self.refresh_cache().await?;
        Ok(new_key)
    }

    /// Demote overlap keys whose window has passed. Run periodically.
    pub async fn retire_expired(&self) -> Result<usize, KeyError> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let cache = self.cache.read().await;
            cache
                .by_kid
                .values()
                .filter(|k| k.status == KeyStatus::Overlap && !k.in_overlap_window(now))
                .map(|k| k.kid.clone())
                .collect()
        };
        for kid in &expired {
            self.store.mark(kid, KeyStatus::Retired, Some(now)).await?;
        }
        if !expired.is_empty() {
            self.refresh_cache().await?;
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active_key_lookup() {
        let ring = KeyRing::new_for_testing().await.unwrap();
        let key = ring.active_signing_key().await.unwrap();
        assert_eq!(key.status, KeyStatus::Active);
        assert_eq!(key.algorithm, KeyAlgorithm::ES256);

        let by_kid = ring.verification_key(Some(&key.kid)).await.unwrap();
        assert_eq!(by_kid.kid, key.kid);
    }

    #[tokio::test]
    async fn test_unknown_kid_fails_after_refetch() {
        let ring = KeyRing::new_for_testing().await.unwrap();
        let err = ring.verification_key(Some("nope")).await.unwrap_err();
        assert!(matches!(err, KeyError::UnknownKid));
    }

    #[tokio::test]
    async fn test_rotation_keeps_overlap_key_verifiable() {
        let ring = KeyRing::new_for_testing().await.unwrap();
        let old = ring.active_signing_key().await.unwrap();

        let new_key = SigningKey::generate_es256().unwrap();
        ring.rotate(new_key.clone(), Duration::hours(24)).await.unwrap();

        let active = ring.active_signing_key().await.unwrap();
        assert_eq!(active.kid, new_key.kid);

        // Old key still resolvable for verification during overlap.
        let overlap = ring.verification_key(Some(&old.kid)).await.unwrap();
        assert_eq!(overlap.status, KeyStatus::Overlap);

        let jwks = ring.jwks().await.unwrap();
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|k| k["kid"].as_str())
            .collect();
        assert!(kids.contains(&old.kid.as_str()));
        assert!(kids.contains(&new_key.kid.as_str()));
    }

    #[tokio::test]
    async fn test_emergency_rotation_drops_old_key_from_jwks() {
        let ring = KeyRing::new_for_testing().await.unwrap();
        let old = ring.active_signing_key().await.unwrap();

        let new_key = SigningKey::generate_es256().unwrap();
        ring.rotate(new_key.clone(), Duration::zero()).await.unwrap();

        let jwks = ring.jwks().await.unwrap();
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|k| k["kid"].as_str())
            .collect();
        assert!(!kids.contains(&old.kid.as_str()));
        assert_eq!(kids, vec![new_key.kid.as_str()]);
    }
}
