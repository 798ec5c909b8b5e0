//! The refresh_token grant: rotation with theft detection.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{ClientRegistry, TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_crypto::jwt::RefreshClaims;
use authrim_crypto::VerifyOptions;
use authrim_events::event_types;
use authrim_store::TokenRevocationIndex;
use chrono::Utc;
use serde_json::json;

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let refresh_jwt = ctx.require_param("refresh_token")?;
    let requested_scope = ctx.param("scope");

    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;

    // Routing fields first (sub, rtv, jti), then the authoritative
    // signature check via the key ring; a kid miss re-fetches the JWKS so
    // emergency-rotated keys verify on the first try.
    let routed: RefreshClaims = engine
        .signer()
        .peek_claims(refresh_jwt)
        .map_err(|_| OAuthError::invalid_grant("Refresh token is not valid"))?;
    if routed.client_id != client.client_id {
        return Err(OAuthError::invalid_grant("Refresh token is not valid"));
    }

    let verified: RefreshClaims = engine
        .signer()
        .verify(
            refresh_jwt,
            &VerifyOptions {
                audience: Some(client.client_id.clone()),
                ..Default::default()
            },
        )
        .await?;

    if engine.revocations().is_revoked(&verified.jti).await.ok() == Some(true) {
        return Err(OAuthError::invalid_grant("Refresh token has been revoked"));
    }

    if !tenant.refresh_rotation_enabled {
        // Test rigs only; release profiles refuse to load with rotation
        // off. The same token is handed back untouched.
        let expires_in = engine.access_ttl(tenant).await;
        return mint_pair(
            engine,
            tenant,
            &client.client_id,
            &verified,
            refresh_jwt.to_string(),
            verified.scope.clone(),
            expires_in,
            false,
        )
        .await;
    }

    let head = engine.families().rotate(
        verified.rtv,
        &verified.jti,
        &verified.sub,
        &client.client_id,
        requested_scope,
    )?;

    let refresh_token = engine
        .sign_refresh_token(
            &verified.sub,
            &client.client_id,
            &head.scope,
            &head.jti,
            head.version,
            head.expires_at,
        )
        .await?;

    let expires_in = engine.access_ttl(tenant).await;
    mint_pair(
        engine,
        tenant,
        &client.client_id,
        &verified,
        refresh_token,
        head.scope,
        expires_in,
        true,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mint_pair(
    engine: &GrantEngine,
    tenant: &TenantProfile,
    client_id: &str,
    verified: &RefreshClaims,
    refresh_token: String,
    scope: String,
    expires_in: u64,
    rotated: bool,
) -> Result<TokenResponse, OAuthError> {
    let mut access_claims =
        engine.base_access_claims(&verified.sub, client_id, &scope, expires_in);
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    let id_token = if scope.split_whitespace().any(|s| s == "openid") {
        let client = engine
            .clients()
            .get(client_id)
            .await
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;
        let mut id_claims = engine.base_id_claims(
            &verified.sub,
            client_id,
            Utc::now().timestamp(),
            expires_in,
        );
        id_claims.at_hash = Some(GrantEngine::half_hash(&access_token));
        Some(engine.sign_id_token(&id_claims, &client).await?)
    } else {
        None
    };

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client_id, "sub": verified.sub }),
    );
    if rotated {
        engine.emit(
            event_types::TOKEN_REFRESH_ROTATED,
            tenant,
            json!({ "client_id": client_id, "sub": verified.sub }),
        );
    }
    if id_token.is_some() {
        engine.emit(
            event_types::TOKEN_ID_ISSUED,
            tenant,
            json!({ "client_id": client_id, "sub": verified.sub }),
        );
    }

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.refresh_token = Some(refresh_token);
    response.id_token = id_token;
    response.scope = Some(scope);
    Ok(response)
}
