//! ID-JAG: identity-assertion authorization grant. Exchanges an external
//! IdP assertion for a local bearer token that records its
//! `original_issuer`.

use super::jwt_bearer::verify_external_assertion;
use super::{token_exchange, GrantEngine};
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{token_types, TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_events::event_types;
use serde_json::json;

const ACCEPTED_SUBJECT_TYPES: &[&str] = &[
    token_types::ID_TOKEN,
    token_types::JWT,
    token_types::SAML2,
];

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let settings = &tenant.token_exchange.id_jag;
    if !settings.enabled {
        return Err(OAuthError::invalid_request(
            "Identity assertion grants are not enabled",
        ));
    }

    let subject_token = ctx.require_param("subject_token")?;
    let subject_token_type = ctx.require_param("subject_token_type")?;
    if !ACCEPTED_SUBJECT_TYPES.contains(&subject_token_type) {
        return Err(OAuthError::invalid_request(
            "Unsupported subject_token_type for identity assertion grant",
        ));
    }
    if subject_token_type == token_types::SAML2 {
        // SAML assertions are terminated by a dedicated gateway before
        // they reach this endpoint.
        return Err(OAuthError::invalid_request(
            "SAML2 subject tokens must be pre-exchanged",
        ));
    }

    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;
    if settings.require_confidential_client && !client.is_confidential() {
        return Err(OAuthError::unauthorized_client(
            "Identity assertion grant requires a confidential client",
        ));
    }

    // An empty allow-list fails closed.
    let (claims, trusted) =
        verify_external_assertion(&engine.deps.trusted_issuers, subject_token).await?;
    if !settings.allowed_issuers.iter().any(|i| i == &trusted.issuer) {
        return Err(OAuthError::invalid_target(
            "Assertion issuer is not allowed",
        ));
    }

    let resources = ctx.params_multi("resource");
    let audiences = ctx.params_multi("audience");
    let granted_targets = token_exchange::resolve_targets(&client, &resources, &audiences)?;

    let requested = ctx.param("scope").unwrap_or("");
    let scope = client.intersect_scopes(requested);

    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims =
        engine.base_access_claims(&claims.sub, &client.client_id, &scope, expires_in);
    if !granted_targets.is_empty() {
        access_claims.aud = granted_targets.into();
    }
    access_claims.acr = claims.acr.clone();
    access_claims.amr = claims.amr.clone();
    access_claims.original_issuer = Some(trusted.issuer.clone());
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({
            "jti": access_jti,
            "client_id": client.client_id,
            "sub": claims.sub,
            "original_issuer": trusted.issuer,
        }),
    );

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.scope = Some(scope);
    response.issued_token_type = Some(token_types::ID_JAG.to_string());
    Ok(response)
}
