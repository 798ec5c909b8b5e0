//! client_credentials: machine-to-machine tokens for confidential clients.
//! Subject is `client:{client_id}`; no ID token, no refresh token.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_events::event_types;
use serde_json::json;

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), false).await?;
    if !client.is_confidential() {
        return Err(OAuthError::unauthorized_client(
            "client_credentials requires a confidential client",
        ));
    }

    let requested = ctx.param("scope").unwrap_or("");
    let scope = client.intersect_scopes(requested);
    if !requested.is_empty() && scope.is_empty() {
        return Err(OAuthError::invalid_scope(
            "No requested scope is allowed for this client",
        ));
    }

    let subject = format!("client:{}", client.client_id);
    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims =
        engine.base_access_claims(&subject, &client.client_id, &scope, expires_in);
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client.client_id, "sub": subject }),
    );

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.scope = Some(scope);
    Ok(response)
}
