//! RFC 7523 JWT-bearer grant: assertions from a configured trusted-issuer
//! table. Access token only; no ID token, no refresh token.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{TokenRequestContext, TokenResponse};
use authrim_config::{ConfigProvider, TenantProfile};
use authrim_crypto::jwt::Audience;
use authrim_events::event_types;
use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedIssuer {
    pub issuer: String,
    /// Pinned public JWKS; checked before any network fetch.
    #[serde(default)]
    pub jwks: Option<serde_json::Value>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    /// The `aud` the assertion must carry.
    pub audience: String,
}

/// Issuer table with a kid-invalidated JWKS fetch cache (external IdP
/// verification for jwt-bearer and ID-JAG).
pub struct TrustedIssuerTable {
    issuers: Vec<TrustedIssuer>,
    http: reqwest::Client,
    jwks_cache: DashMap<String, serde_json::Value>,
}

impl TrustedIssuerTable {
    pub fn new(issuers: Vec<TrustedIssuer>) -> Self {
        Self {
            issuers,
            http: reqwest::Client::new(),
            jwks_cache: DashMap::new(),
        }
    }

    pub async fn from_config(config: &ConfigProvider) -> Self {
        let issuers = match config.get("oidc.jwtBearer.trustedIssuers").await {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "malformed trusted-issuer table, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Self::new(issuers)
    }

    pub fn find(&self, issuer: &str) -> Option<&TrustedIssuer> {
        self.issuers.iter().find(|t| t.issuer == issuer)
    }

    fn key_from_jwks(
        jwks: &serde_json::Value,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Option<DecodingKey> {
        let keys = jwks.get("keys")?.as_array()?;
        let jwk = keys.iter().find(|k| match kid {
            Some(kid) => k.get("kid").and_then(|v| v.as_str()) == Some(kid),
            None => true,
        })?;
        let member = |name: &str| jwk.get(name).and_then(|v| v.as_str());
        match alg {
            Algorithm::RS256 => {
                DecodingKey::from_rsa_components(member("n")?, member("e")?).ok()
            }
            Algorithm::ES256 => DecodingKey::from_ec_components(member("x")?, member("y")?).ok(),
            _ => None,
        }
    }

    /// Resolve a verification key for `issuer`/`kid`. A kid miss drops the
    /// cached document and refetches once.
    pub async fn resolve_key(
        &self,
        issuer: &TrustedIssuer,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<DecodingKey, OAuthError> {
        if let Some(jwks) = &issuer.jwks {
            if let Some(key) = Self::key_from_jwks(jwks, kid, alg) {
                return Ok(key);
            }
        }

        let Some(jwks_uri) = &issuer.jwks_uri else {
            return Err(OAuthError::invalid_grant("Assertion signature is not valid"));
        };

        if let Some(cached) = self.jwks_cache.get(jwks_uri) {
            if let Some(key) = Self::key_from_jwks(&cached, kid, alg) {
                return Ok(key);
            }
        }

        let fetched: serde_json::Value = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| OAuthError::server_error(e.to_string()))?
            .json()
            .await
            .map_err(|e| OAuthError::server_error(e.to_string()))?;
        self.jwks_cache.insert(jwks_uri.clone(), fetched.clone());

        Self::key_from_jwks(&fetched, kid, alg)
            .ok_or_else(|| OAuthError::invalid_grant("Assertion signature is not valid"))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BearerAssertionClaims {
    pub iss: String,
    pub sub: String,
    #[allow(dead_code)]
    pub aud: Audience,
    #[allow(dead_code)]
    pub exp: i64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub acr: Option<String>,
    #[serde(default)]
    pub amr: Option<Vec<String>>,
}

/// Verify an externally issued assertion against the trusted-issuer table.
pub(crate) async fn verify_external_assertion(
    table: &TrustedIssuerTable,
    assertion: &str,
) -> Result<(BearerAssertionClaims, TrustedIssuer), OAuthError> {
    let header = decode_header(assertion)
        .map_err(|_| OAuthError::invalid_grant("Malformed assertion"))?;

    let mut peek = Validation::new(header.alg);
    peek.validate_exp = false;
    peek.validate_aud = false;
    peek.required_spec_claims = Default::default();
    peek.insecure_disable_signature_validation();
    let routed = decode::<BearerAssertionClaims>(
        assertion,
        &DecodingKey::from_secret(b"peek"),
        &peek,
    )
    .map_err(|_| OAuthError::invalid_grant("Malformed assertion"))?
    .claims;

    let trusted = table
        .find(&routed.iss)
        .ok_or_else(|| OAuthError::invalid_grant("Assertion issuer is not trusted"))?
        .clone();

    let key = table
        .resolve_key(&trusted, header.kid.as_deref(), header.alg)
        .await?;
    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[&trusted.audience]);
    validation.set_issuer(&[&trusted.issuer]);
    validation.leeway = 30;

    let claims = decode::<BearerAssertionClaims>(assertion, &key, &validation)
        .map_err(|_| OAuthError::invalid_grant("Assertion verification failed"))?
        .claims;
    Ok((claims, trusted))
}

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let assertion = ctx.require_param("assertion")?;
    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), false).await?;

    let (claims, trusted) =
        verify_external_assertion(&engine.deps.trusted_issuers, assertion).await?;

    let requested_scope = ctx.param("scope").unwrap_or("");
    let granted: Vec<&str> = requested_scope
        .split_whitespace()
        .filter(|s| trusted.allowed_scopes.iter().any(|a| a == s))
        .collect();
    if !requested_scope.is_empty() && granted.is_empty() {
        return Err(OAuthError::invalid_scope(
            "No requested scope is allowed for this issuer",
        ));
    }
    let scope = granted.join(" ");

    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims =
        engine.base_access_claims(&claims.sub, &client.client_id, &scope, expires_in);
    access_claims.acr = claims.acr.clone();
    access_claims.amr = claims.amr.clone();
    access_claims.original_issuer = Some(trusted.issuer.clone());
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client.client_id, "sub": claims.sub }),
    );

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.scope = Some(scope);
    Ok(response)
}
