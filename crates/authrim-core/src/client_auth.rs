//! Shared client-authentication preamble for every grant.
//!
//! Accepted in order: signed JWT assertion (`private_key_jwt` /
//! `client_secret_jwt`), HTTP Basic (credentials URL-decoded after base64),
//! form-posted `client_id` + `client_secret`. Public clients pass only when
//! the calling grant explicitly permits them.

use crate::error::OAuthError;
use crate::models::{ClientMetadata, ClientRegistry, TokenRequestContext};
use authrim_crypto::jwt::Audience;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::Deserialize;

pub const ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatedWith {
    PrivateKeyJwt,
    ClientSecretJwt,
    Basic,
    Post,
    None,
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[allow(dead_code)]
    aud: Audience,
    #[allow(dead_code)]
    exp: i64,
}

fn form_decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={raw}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

fn parse_basic(header: &str) -> Result<(String, String), OAuthError> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| OAuthError::invalid_client("Unsupported authorization scheme"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| OAuthError::invalid_client("Malformed Basic credentials"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| OAuthError::invalid_client("Malformed Basic credentials"))?;
    let (id, secret) = decoded
        .split_once(':')
        .ok_or_else(|| OAuthError::invalid_client("Malformed Basic credentials"))?;
    Ok((form_decode(id), form_decode(secret)))
}

fn decoding_key_from_client_jwk(
    jwks: &serde_json::Value,
    kid: Option<&str>,
    alg: Algorithm,
) -> Result<DecodingKey, OAuthError> {
    let keys = jwks
        .get("keys")
        .and_then(|k| k.as_array())
        .ok_or_else(|| OAuthError::invalid_client("Client has no registered JWKS"))?;
    let jwk = keys
        .iter()
        .find(|k| match kid {
            Some(kid) => k.get("kid").and_then(|v| v.as_str()) == Some(kid),
            None => true,
        })
        .ok_or_else(|| OAuthError::invalid_client("Client assertion key not found"))?;

    let member = |name: &str| jwk.get(name).and_then(|v| v.as_str());
    let key = match alg {
        Algorithm::RS256 => {
            let n = member("n").ok_or_else(|| OAuthError::invalid_client("Malformed client JWK"))?;
            let e = member("e").ok_or_else(|| OAuthError::invalid_client("Malformed client JWK"))?;
            DecodingKey::from_rsa_components(n, e)
        }
        Algorithm::ES256 => {
            let x = member("x").ok_or_else(|| OAuthError::invalid_client("Malformed client JWK"))?;
            let y = member("y").ok_or_else(|| OAuthError::invalid_client("Malformed client JWK"))?;
            DecodingKey::from_ec_components(x, y)
        }
        _ => return Err(OAuthError::invalid_client("Unsupported assertion algorithm")),
    }
    .map_err(|_| OAuthError::invalid_client("Malformed client JWK"))?;
    Ok(key)
}

async fn authenticate_assertion(
    assertion: &str,
    registry: &dyn ClientRegistry,
    accepted_audiences: &[&str],
) -> Result<(ClientMetadata, AuthenticatedWith), OAuthError> {
    let header =
        decode_header(assertion).map_err(|_| OAuthError::invalid_client("Malformed assertion"))?;

    // Pre-read iss/sub to locate the client, then verify properly.
    let mut peek = Validation::new(header.alg);
    peek.validate_exp = false;
    peek.validate_aud = false;
    peek.required_spec_claims = Default::default();
    peek.insecure_disable_signature_validation();
    let unverified = decode::<AssertionClaims>(assertion, &DecodingKey::from_secret(b"peek"), &peek)
        .map_err(|_| OAuthError::invalid_client("Malformed assertion"))?
        .claims;

    if unverified.iss != unverified.sub {
        return Err(OAuthError::invalid_client("Assertion iss/sub mismatch"));
    }
    let client_id = unverified.sub.clone();
    let client = registry
        .get(&client_id)
        .await
        .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

    let mut validation = Validation::new(header.alg);
    validation.set_audience(accepted_audiences);
    validation.leeway = 30;

    let method = match header.alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = client
                .client_secret
                .as_ref()
                .ok_or_else(|| OAuthError::invalid_client("Client cannot use client_secret_jwt"))?;
            let key = DecodingKey::from_secret(secret.expose_secret().as_bytes());
            decode::<AssertionClaims>(assertion, &key, &validation)
                .map_err(|_| OAuthError::invalid_client("Client assertion verification failed"))?;
            AuthenticatedWith::ClientSecretJwt
        }
        Algorithm::RS256 | Algorithm::ES256 => {
            let jwks = client
                .jwks
                .as_ref()
                .ok_or_else(|| OAuthError::invalid_client("Client has no registered JWKS"))?;
            let key = decoding_key_from_client_jwk(jwks, header.kid.as_deref(), header.alg)?;
            decode::<AssertionClaims>(assertion, &key, &validation)
                .map_err(|_| OAuthError::invalid_client("Client assertion verification failed"))?;
            AuthenticatedWith::PrivateKeyJwt
        }
        _ => return Err(OAuthError::invalid_client("Unsupported assertion algorithm")),
    };

    Ok((client, method))
}

/// Authenticate the requesting client. `allow_public` reflects whether the
/// calling grant accepts public clients at all.
pub async fn authenticate_client(
    ctx: &TokenRequestContext,
    registry: &dyn ClientRegistry,
    issuer: &str,
    allow_public: bool,
) -> Result<(ClientMetadata, AuthenticatedWith), OAuthError> {
    if let Some(assertion) = ctx.param("client_assertion") {
        match ctx.param("client_assertion_type") {
            Some(ASSERTION_TYPE_JWT_BEARER) => {}
            _ => {
                return Err(OAuthError::invalid_client(
                    "Unsupported client_assertion_type",
                ))
            }
        }
        let accepted = [issuer, ctx.uri.as_str()];
        let (client, method) = authenticate_assertion(assertion, registry, &accepted).await?;
        if let Some(form_id) = ctx.param("client_id") {
            if form_id != client.client_id {
                return Err(OAuthError::invalid_client("client_id mismatch"));
            }
        }
        return Ok((client, method));
    }

    if let Some(header) = &ctx.authorization_header {
        if header.starts_with("Basic ") {
            let (client_id, secret) = parse_basic(header)?;
            let client = registry
                .get(&client_id)
                .await
                .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;
            if !client.verify_secret(&secret) {
                return Err(OAuthError::invalid_client("Client authentication failed"));
            }
            return Ok((client, AuthenticatedWith::Basic));
        }
    }

    let client_id = ctx.require_param("client_id").map_err(|_| {
        OAuthError::invalid_client("No client authentication presented")
    })?;
    let client = registry
        .get(client_id)
        .await
        .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

    if let Some(secret) = ctx.param("client_secret") {
        if !client.verify_secret(secret) {
            return Err(OAuthError::invalid_client("Client authentication failed"));
        }
        return Ok((client, AuthenticatedWith::Post));
    }

    if client.is_confidential() {
        return Err(OAuthError::invalid_client(
            "Confidential client must authenticate",
        ));
    }
    if !allow_public {
        return Err(OAuthError::invalid_client(
            "Public clients are not accepted for this grant",
        ));
    }
    Ok((client, AuthenticatedWith::None))
}
