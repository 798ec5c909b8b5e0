//! OpenID Connect Native SSO: ID token + device secret → fresh tokens for a
//! sibling app, without user interaction.
//!
//! Cross-client exchange requires all three allow flags: the tenant, the
//! requesting client and the originating client.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{token_types, TokenRequestContext, TokenResponse};
use crate::rate_limit::rules;
use authrim_config::TenantProfile;
use authrim_crypto::jwt::IdClaims;
use authrim_crypto::{s256, VerifyOptions};
use authrim_events::event_types;
use authrim_store::{DeviceSecretError, DeviceSecretStore};
use crate::models::ClientRegistry;
use chrono::{Duration, Utc};
use serde_json::json;
use std::time::Duration as StdDuration;

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    if !tenant.native_sso.enabled {
        return Err(OAuthError::invalid_request("Native SSO is not enabled"));
    }

    let subject_token = ctx.require_param("subject_token")?;
    let actor_token = ctx.require_param("actor_token")?;

    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;
    if !client.native_sso_enabled {
        return Err(OAuthError::unauthorized_client(
            "Client is not enabled for Native SSO",
        ));
    }

    // One-minute windows per (client, ip); a tripped window blocks for the
    // configured duration.
    let ip = ctx.client_ip.as_deref().unwrap_or("unknown");
    engine
        .rate_limits()
        .check(rules::NATIVE_SSO, &format!("{}:{ip}", client.client_id))
        .await?;

    // The device secret travels as `{id}.{secret}`.
    let (secret_id, secret) = actor_token
        .split_once('.')
        .ok_or_else(|| OAuthError::invalid_grant("Device secret is not valid"))?;

    let device_secret = engine
        .device_secrets()
        .validate_and_use(secret_id, secret)
        .await
        .map_err(|e| match e {
            DeviceSecretError::StoreUnavailable(detail) => OAuthError::server_error(detail),
            _ => OAuthError::invalid_grant("Device secret is not valid"),
        })?;

    let id_claims: IdClaims = engine
        .signer()
        .verify(subject_token, &VerifyOptions::default())
        .await?;

    if id_claims.sub != device_secret.user_id {
        return Err(OAuthError::invalid_grant(
            "ID token subject does not match the device secret",
        ));
    }

    // Replays of the same ID token are blocked within a short window.
    let replay_ttl = StdDuration::from_secs(tenant.native_sso.rate_limit_window_seconds.max(60));
    if !engine
        .deps
        .sso_replay
        .check_and_insert(&format!("nsso:{}", s256(subject_token)), replay_ttl)
    {
        return Err(OAuthError::invalid_grant("Subject token already exchanged"));
    }

    // Cross-client exchange: every flag must agree.
    let originating_client_id = id_claims.aud.clone();
    if originating_client_id != client.client_id {
        let originating = engine
            .clients()
            .get(&originating_client_id)
            .await
            .ok_or_else(|| OAuthError::invalid_target("Unknown originating client"))?;
        let allowed = tenant.native_sso.allow_cross_client
            && client.allow_cross_client_native_sso
            && originating.allow_cross_client_native_sso;
        if !allowed {
            return Err(OAuthError::invalid_target(
                "Cross-client Native SSO is not allowed",
            ));
        }
    }

    let scope = "openid profile".to_string();
    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims = engine.base_access_claims(
        &device_secret.user_id,
        &client.client_id,
        &scope,
        expires_in,
    );
    access_claims.amr = id_claims.amr.clone();
    access_claims.acr = id_claims.acr.clone();
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    let mut new_id_claims = engine.base_id_claims(
        &device_secret.user_id,
        &client.client_id,
        id_claims.auth_time,
        expires_in,
    );
    new_id_claims.at_hash = Some(GrantEngine::half_hash(&access_token));
    new_id_claims.ds_hash = Some(GrantEngine::half_hash(actor_token));
    new_id_claims.sid = Some(device_secret.session_id.clone());
    new_id_claims.acr = id_claims.acr.clone();
    new_id_claims.amr = id_claims.amr.clone();
    let id_token = engine.sign_id_token(&new_id_claims, &client).await?;

    let refresh_ttl = engine.refresh_ttl().await;
    let head = engine.families().replace_family(
        &device_secret.user_id,
        &client.client_id,
        &scope,
        Duration::seconds(refresh_ttl as i64),
    )?;
    let refresh_token = engine
        .sign_refresh_token(
            &device_secret.user_id,
            &client.client_id,
            &scope,
            &head.jti,
            head.version,
            head.expires_at,
        )
        .await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({
            "jti": access_jti,
            "client_id": client.client_id,
            "sub": device_secret.user_id,
            "native_sso": true,
        }),
    );
    engine.emit(
        event_types::TOKEN_REFRESH_ISSUED,
        tenant,
        json!({ "jti": head.jti, "client_id": client.client_id, "sub": device_secret.user_id }),
    );

    let now = Utc::now();
    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.refresh_token = Some(refresh_token);
    response.id_token = Some(id_token);
    response.scope = Some(scope);
    response.issued_token_type = Some(token_types::ACCESS_TOKEN.to_string());
    if device_secret.expires_at > now && device_secret.is_active {
        // Secret stays valid for further sibling exchanges.
        response.device_secret = Some(actor_token.to_string());
    }
    Ok(response)
}
