//! JWT claim sets and the signer that mints them through the key ring.

use crate::keyring::{KeyError, KeyRing};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token encoding failed: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),
    #[error("Token validation failed: {reason}")]
    ValidationError { reason: String },
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token format")]
    InvalidFormat,
    #[error("Unknown signing key")]
    UnknownKey,
    #[error("Key management error: {0}")]
    KeyError(String),
}

impl From<KeyError> for JwtError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::UnknownKid => JwtError::UnknownKey,
            other => JwtError::KeyError(other.to_string()),
        }
    }
}

/// `aud` is a string or a list of strings on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, candidate: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == candidate,
            Audience::Multiple(auds) => auds.iter().any(|a| a == candidate),
        }
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            Audience::Single(aud) => vec![aud.clone()],
            Audience::Multiple(auds) => auds.clone(),
        }
    }
}

impl From<String> for Audience {
    fn from(aud: String) -> Self {
        Audience::Single(aud)
    }
}

impl From<Vec<String>> for Audience {
    fn from(auds: Vec<String>) -> Self {
        Audience::Multiple(auds)
    }
}

/// DPoP sender-constraint confirmation claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub jkt: String,
}

/// RFC 8693 `act` claim. Nesting is capped at one level by the grant engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act: Option<Box<Actor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub scope: String,
    pub client_id: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act: Option<Actor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ds_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub scope: String,
    pub client_id: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    /// Rotation version; a rotation request must present the head version.
    pub rtv: u32,
}

/// OpenID Back-Channel Logout 1.0 logout token. Carries the logout `events`
/// member and never a `nonce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub events: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

impl LogoutClaims {
    pub fn has_backchannel_event(&self) -> bool {
        self.events
            .as_object()
            .map(|o| o.contains_key(BACKCHANNEL_LOGOUT_EVENT))
            .unwrap_or(false)
    }

    pub fn backchannel_events() -> serde_json::Value {
        serde_json::json!({ BACKCHANNEL_LOGOUT_EVENT: {} })
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Expected audience; audience validation is skipped when `None`.
    pub audience: Option<String>,
    /// Accept expired signatures (logout `id_token_hint` path).
    pub allow_expired: bool,
    /// Skew allowance in seconds.
    pub leeway: u64,
}

/// Mints and verifies compact JWS through the [`KeyRing`].
pub struct TokenSigner {
    keyring: Arc<KeyRing>,
    issuer: String,
}

impl TokenSigner {
    pub fn new(keyring: Arc<KeyRing>, issuer: String) -> Self {
        Self { keyring, issuer }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    async fn sign_with_typ<T: Serialize>(
        &self,
        claims: &T,
        typ: Option<&str>,
    ) -> Result<String, JwtError> {
        let key = self.keyring.active_signing_key().await?;
        let mut header = Header::new(key.algorithm.jwt_algorithm());
        header.kid = Some(key.kid.clone());
        if let Some(typ) = typ {
            header.typ = Some(typ.to_string());
        }
        Ok(encode(&header, claims, key.encoding_key())?)
    }

    pub async fn sign_access(&self, claims: &AccessClaims) -> Result<String, JwtError> {
        self.sign_with_typ(claims, Some("at+jwt")).await
    }

    pub async fn sign_id(&self, claims: &IdClaims) -> Result<String, JwtError> {
        self.sign_with_typ(claims, None).await
    }

    pub async fn sign_refresh(&self, claims: &RefreshClaims) -> Result<String, JwtError> {
        self.sign_with_typ(claims, None).await
    }

    pub async fn sign_logout(&self, claims: &LogoutClaims) -> Result<String, JwtError> {
        self.sign_with_typ(claims, Some("logout+jwt")).await
    }

    /// Verify a token we issued. The decoding key is resolved by header
    /// `kid` through the ring, which refetches on a `kid` miss so tokens
    /// signed right after an emergency rotation still verify.
    pub async fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        opts: &VerifyOptions,
    ) -> Result<T, JwtError> {
        let header = decode_header(token).map_err(|_| JwtError::InvalidFormat)?;
        let key = self.keyring.verification_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(key.algorithm.jwt_algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = opts.leeway.max(30);
        match &opts.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if opts.allow_expired {
            validation.validate_exp = false;
            validation.required_spec_claims = HashSet::new();
        }

        let data = decode::<T>(token, key.decoding_key(), &validation).map_err(|e| match e.kind()
        {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            _ => JwtError::ValidationError {
                reason: e.to_string(),
            },
        })?;
        Ok(data.claims)
    }

    /// Extract claims without signature validation. Used only to route a
    /// token (shard/jti lookup) before the authoritative verification.
    pub fn peek_claims<T: DeserializeOwned>(&self, token: &str) -> Result<T, JwtError> {
        let header = decode_header(token).map_err(|_| JwtError::InvalidFormat)?;
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        validation.insecure_disable_signature_validation();

        let dummy_key = DecodingKey::from_secret(b"peek");
        let data = decode::<T>(token, &dummy_key, &validation).map_err(|_| JwtError::InvalidFormat)?;
        Ok(data.claims)
    }

    /// Header algorithm of a compact JWS, for callers that gate on alg.
    pub fn peek_algorithm(token: &str) -> Result<Algorithm, JwtError> {
        Ok(decode_header(token).map_err(|_| JwtError::InvalidFormat)?.alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyRing;
    use chrono::Utc;

    fn access_claims(signer: &TokenSigner) -> AccessClaims {
        let now = Utc::now().timestamp();
        AccessClaims {
            iss: signer.issuer().to_string(),
            sub: "user-1".to_string(),
            aud: Audience::Single(signer.issuer().to_string()),
            scope: "openid profile".to_string(),
            client_id: "demo-client".to_string(),
            jti: "00-abc".to_string(),
            iat: now,
            exp: now + 900,
            cnf: None,
            authorization_details: None,
            act: None,
            acr: None,
            amr: None,
            roles: None,
            permissions: None,
            anonymous: None,
            original_issuer: None,
            tenant: None,
        }
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let ring = Arc::new(KeyRing::new_for_testing().await.unwrap());
        let signer = TokenSigner::new(ring, "https://op.example".to_string());

        let token = signer.sign_access(&access_claims(&signer)).await.unwrap();
        let verified: AccessClaims = signer
            .verify(&token, &VerifyOptions::default())
            .await
            .unwrap();
        assert_eq!(verified.sub, "user-1");
        assert_eq!(verified.client_id, "demo-client");

        let header = decode_header(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some("at+jwt"));
        assert!(header.kid.is_some());
    }

    #[tokio::test]
    async fn test_expired_token_rejected_unless_allowed() {
        let ring = Arc::new(KeyRing::new_for_testing().await.unwrap());
        let signer = TokenSigner::new(ring, "https://op.example".to_string());

        let mut claims = access_claims(&signer);
        claims.iat = Utc::now().timestamp() - 7200;
        claims.exp = Utc::now().timestamp() - 3600;
        let token = signer.sign_access(&claims).await.unwrap();

        let err = signer
            .verify::<AccessClaims>(&token, &VerifyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JwtError::TokenExpired));

        let opts = VerifyOptions {
            allow_expired: true,
            ..Default::default()
        };
        let verified: AccessClaims = signer.verify(&token, &opts).await.unwrap();
        assert_eq!(verified.sub, "user-1");
    }

    #[tokio::test]
    async fn test_audience_list_round_trip() {
        let ring = Arc::new(KeyRing::new_for_testing().await.unwrap());
        let signer = TokenSigner::new(ring, "https://op.example".to_string());

        let mut claims = access_claims(&signer);
        claims.aud = Audience::Multiple(vec!["https://api.a".into(), "https://api.b".into()]);
        let token = signer.sign_access(&claims).await.unwrap();

        let verified: AccessClaims = signer
            .verify(&token, &VerifyOptions::default())
            .await
            .unwrap();
        assert!(verified.aud.contains("https://api.a"));
        assert!(verified.aud.contains("https://api.b"));
        assert!(!verified.aud.contains("https://api.c"));
    }

    #[tokio::test]
    async fn test_logout_token_events_claim() {
        let ring = Arc::new(KeyRing::new_for_testing().await.unwrap());
        let signer = TokenSigner::new(ring, "https://op.example".to_string());

        let now = Utc::now().timestamp();
        let claims = LogoutClaims {
            iss: signer.issuer().to_string(),
            sub: Some("user-1".to_string()),
            aud: "rp-1".to_string(),
            iat: now,
            exp: now + 120,
            jti: "lt-1".to_string(),
            events: LogoutClaims::backchannel_events(),
            sid: Some("sess_00_abc".to_string()),
        };
        let token = signer.sign_logout(&claims).await.unwrap();

        let opts = VerifyOptions {
            audience: Some("rp-1".to_string()),
            ..Default::default()
        };
        let verified: LogoutClaims = signer.verify(&token, &opts).await.unwrap();
        assert!(verified.has_backchannel_event());
        assert_eq!(verified.sid.as_deref(), Some("sess_00_abc"));
    }
}
