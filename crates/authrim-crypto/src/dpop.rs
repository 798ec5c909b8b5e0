//! DPoP (RFC 9449) proof validation with a per-client replay window.

use crate::hashing::{access_token_hash, jwk_thumbprint};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DpopError {
    #[error("DPoP proof is missing")]
    Missing,
    #[error("DPoP proof is malformed")]
    Malformed,
    #[error("DPoP proof typ must be dpop+jwt")]
    WrongType,
    #[error("DPoP proof uses an unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("DPoP proof embeds private key material")]
    PrivateKeyMaterial,
    #[error("DPoP proof signature is invalid")]
    SignatureInvalid,
    #[error("DPoP htm does not match the request method")]
    MethodMismatch,
    #[error("DPoP htu does not match the request URI")]
    UriMismatch,
    #[error("DPoP proof iat is outside the acceptance window")]
    IatOutOfWindow,
    #[error("DPoP proof jti was already used")]
    Replayed,
    #[error("DPoP ath does not match the access token")]
    AccessTokenHashMismatch,
    #[error("DPoP replay store unavailable")]
    ReplayStoreUnavailable,
}

/// Per-client replay window. Implementations insert-if-absent with a TTL;
/// errors fail closed at the validator.
#[async_trait::async_trait]
pub trait DpopReplayStore: Send + Sync {
    /// Returns `true` when the jti was fresh (and is now recorded).
    async fn check_and_insert(
        &self,
        client_id: &str,
        jti: &str,
        ttl: Duration,
    ) -> Result<bool, String>;
}

#[derive(Debug, Clone)]
pub struct DpopProof {
    /// RFC 7638 thumbprint of the proof key.
    pub jkt: String,
    pub jti: String,
}

#[derive(Debug, Deserialize)]
struct DpopClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(default)]
    ath: Option<String>,
}

pub struct DpopValidator {
    replay: Arc<dyn DpopReplayStore>,
    max_skew_secs: i64,
    replay_window: Duration,
}

impl DpopValidator {
    pub fn new(replay: Arc<dyn DpopReplayStore>, max_skew_secs: i64, replay_window: Duration) -> Self {
        Self {
            replay,
            max_skew_secs,
            replay_window,
        }
    }

    /// Validate a proof for (`http_method`, `http_uri`); returns the key
    /// thumbprint on success. `access_token` enables the `ath` binding
    /// check for resource-style calls.
    pub async fn validate(
        &self,
        proof_jwt: &str,
        http_method: &str,
        http_uri: &str,
        access_token: Option<&str>,
        client_id: &str,
    ) -> Result<DpopProof, DpopError> {
        let (header, algorithm) = parse_proof_header(proof_jwt)?;

        let jwk = header.get("jwk").ok_or(DpopError::Malformed)?;
        if jwk.get("d").is_some() || jwk.get("p").is_some() || jwk.get("q").is_some() {
            return Err(DpopError::PrivateKeyMaterial);
        }
        let decoding_key = decoding_key_from_jwk(jwk)?;
        let jkt = jwk_thumbprint(jwk).map_err(|_| DpopError::Malformed)?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<DpopClaims>(proof_jwt, &decoding_key, &validation)
            .map_err(|_| DpopError::SignatureInvalid)?
            .claims;

        if !claims.htm.eq_ignore_ascii_case(http_method) {
            return Err(DpopError::MethodMismatch);
        }
        if !htu_matches(&claims.htu, http_uri) {
            return Err(DpopError::UriMismatch);
        }

        let now = Utc::now().timestamp();
        if (now - claims.iat).abs() > self.max_skew_secs {
            return Err(DpopError::IatOutOfWindow);
        }

        if let Some(token) = access_token {
            let expected = access_token_hash(token);
            let presented = claims.ath.as_deref().ok_or(DpopError::AccessTokenHashMismatch)?;
            if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
                return Err(DpopError::AccessTokenHashMismatch);
            }
        }

        let fresh = self
            .replay
            .check_and_insert(client_id, &claims.jti, self.replay_window)
            .await
            .map_err(|_| DpopError::ReplayStoreUnavailable)?;
        if !fresh {
            return Err(DpopError::Replayed);
        }

        Ok(DpopProof {
            jkt,
            jti: claims.jti,
        })
    }
}

fn parse_proof_header(proof_jwt: &str) -> Result<(serde_json::Value, Algorithm), DpopError> {
    let header_part = proof_jwt.split('.').next().ok_or(DpopError::Malformed)?;
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_part)
        .map_err(|_| DpopError::Malformed)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| DpopError::Malformed)?;

    match header.get("typ").and_then(|v| v.as_str()) {
        Some(typ) if typ.eq_ignore_ascii_case("dpop+jwt") => {}
        _ => return Err(DpopError::WrongType),
    }

    let algorithm = match header.get("alg").and_then(|v| v.as_str()) {
        Some("ES256") => Algorithm::ES256,
        Some("RS256") => Algorithm::RS256,
        Some(_) => return Err(DpopError::UnsupportedAlgorithm),
        None => return Err(DpopError::Malformed),
    };

    Ok((header, algorithm))
}

fn decoding_key_from_jwk(jwk: &serde_json::Value) -> Result<DecodingKey, DpopError> {
    let member = |name: &str| jwk.get(name).and_then(|v| v.as_str());
    match member("kty") {
        Some("EC") => {
            let x = member("x").ok_or(DpopError::Malformed)?;
            let y = member("y").ok_or(DpopError::Malformed)?;
            DecodingKey::from_ec_components(x, y).map_err(|_| DpopError::Malformed)
        }
        Some("RSA") => {
            let n = member("n").ok_or(DpopError::Malformed)?;
            let e = member("e").ok_or(DpopError::Malformed)?;
            DecodingKey::from_rsa_components(n, e).map_err(|_| DpopError::Malformed)
        }
        _ => Err(DpopError::UnsupportedAlgorithm),
    }
}

/// htu comparison: absolute URI, query and fragment ignored, scheme and host
/// case-insensitive, default ports normalized.
fn htu_matches(claimed: &str, actual: &str) -> bool {
    let (Ok(a), Ok(b)) = (Url::parse(claimed), Url::parse(actual)) else {
        return false;
    };
    a.scheme().eq_ignore_ascii_case(b.scheme())
        && a.host_str().map(|h| h.to_ascii_lowercase()) == b.host_str().map(|h| h.to_ascii_lowercase())
        && a.port_or_known_default() == b.port_or_known_default()
        && a.path() == b.path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    struct MemoryReplay {
        seen: DashMap<String, ()>,
        fail: bool,
    }

    impl MemoryReplay {
        fn new() -> Self {
            Self {
                seen: DashMap::new(),
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl DpopReplayStore for MemoryReplay {
        async fn check_and_insert(
            &self,
            client_id: &str,
            jti: &str,
            _ttl: Duration,
        ) -> Result<bool, String> {
            if self.fail {
                return Err("store down".to_string());
            }
            let key = format!("{client_id}:{jti}");
            Ok(self.seen.insert(key, ()).is_none())
        }
    }

    // Minimal ES256 proof builder for tests.
    fn build_proof(htm: &str, htu: &str, iat: i64, jti: &str, ath: Option<&str>) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let rng = ring::rand::SystemRandom::new();
        let alg = &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING;
        let pkcs8 = ring::signature::EcdsaKeyPair::generate_pkcs8(alg, &rng).unwrap();
        let pair =
            ring::signature::EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng).unwrap();
        let point = pair.public_key().as_ref();
        let x = URL_SAFE_NO_PAD.encode(&point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&point[33..65]);

        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": { "kty": "EC", "crv": "P-256", "x": x, "y": y },
        });
        let mut payload = serde_json::json!({
            "jti": jti, "htm": htm, "htu": htu, "iat": iat,
        });
        if let Some(ath) = ath {
            payload["ath"] = serde_json::json!(ath);
        }

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        );
        let sig = pair.sign(&rng, signing_input.as_bytes()).unwrap();
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }

    fn validator() -> DpopValidator {
        DpopValidator::new(Arc::new(MemoryReplay::new()), 300, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn test_valid_proof_returns_thumbprint() {
        let v = validator();
        let proof = build_proof(
            "POST",
            "https://op.example/token",
            Utc::now().timestamp(),
            "jti-1",
            None,
        );
        let result = v
            .validate(&proof, "POST", "https://op.example/token?foo=bar", None, "client-1")
            .await
            .unwrap();
        assert!(!result.jkt.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_jti_rejected() {
        let v = validator();
        let proof = build_proof(
            "POST",
            "https://op.example/token",
            Utc::now().timestamp(),
            "jti-replay",
            None,
        );
        v.validate(&proof, "POST", "https://op.example/token", None, "client-1")
            .await
            .unwrap();
        let err = v
            .validate(&proof, "POST", "https://op.example/token", None, "client-1")
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::Replayed));
    }

    #[tokio::test]
    async fn test_htm_and_htu_mismatch_rejected() {
        let v = validator();
        let proof = build_proof(
            "POST",
            "https://op.example/token",
            Utc::now().timestamp(),
            "jti-2",
            None,
        );
        assert!(matches!(
            v.validate(&proof, "GET", "https://op.example/token", None, "c")
                .await
                .unwrap_err(),
            DpopError::MethodMismatch
        ));
        assert!(matches!(
            v.validate(&proof, "POST", "https://op.example/other", None, "c")
                .await
                .unwrap_err(),
            DpopError::UriMismatch
        ));
    }

    #[tokio::test]
    async fn test_stale_iat_rejected() {
        let v = validator();
        let proof = build_proof(
            "POST",
            "https://op.example/token",
            Utc::now().timestamp() - 3600,
            "jti-3",
            None,
        );
        let err = v
            .validate(&proof, "POST", "https://op.example/token", None, "c")
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::IatOutOfWindow));
    }

    #[tokio::test]
    async fn test_ath_binding() {
        let v = validator();
        let token = "the.access.token";
        let proof = build_proof(
            "GET",
            "https://rs.example/resource",
            Utc::now().timestamp(),
            "jti-4",
            Some(&access_token_hash(token)),
        );
        v.validate(&proof, "GET", "https://rs.example/resource", Some(token), "c")
            .await
            .unwrap();

        let proof = build_proof(
            "GET",
            "https://rs.example/resource",
            Utc::now().timestamp(),
            "jti-5",
            Some(&access_token_hash("some-other-token")),
        );
        let err = v
            .validate(&proof, "GET", "https://rs.example/resource", Some(token), "c")
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::AccessTokenHashMismatch));
    }

    #[tokio::test]
    async fn test_replay_store_failure_fails_closed() {
        let mut store = MemoryReplay::new();
        store.fail = true;
        let v = DpopValidator::new(Arc::new(store), 300, Duration::from_secs(600));
        let proof = build_proof(
            "POST",
            "https://op.example/token",
            Utc::now().timestamp(),
            "jti-6",
            None,
        );
        let err = v
            .validate(&proof, "POST", "https://op.example/token", None, "c")
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::ReplayStoreUnavailable));
    }
}
