//! RFC 8693 token exchange, plus the Native SSO and ID-JAG extensions.

use super::{id_jag, native_sso, GrantEngine};
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{token_types, ClientMetadata, TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_crypto::jwt::{AccessClaims, Actor, Audience};
use authrim_crypto::VerifyOptions;
use authrim_events::event_types;
use authrim_store::TokenRevocationIndex;
use serde_json::json;

fn short_type(token_type: &str) -> &str {
    token_type
        .rsplit(':')
        .next()
        .unwrap_or(token_type)
}

/// Collapse an inherited actor chain to a single level: the direct actor
/// survives, deeper history is dropped.
fn collapse_act(mut act: Actor) -> Actor {
    if let Some(inner) = act.act.take() {
        let mut inner = *inner;
        inner.act = None;
        act.act = Some(Box::new(inner));
    }
    act
}

pub(crate) fn build_actor(
    actor_sub: Option<String>,
    actor_client: Option<String>,
    inherited: Option<Actor>,
) -> Actor {
    let mut act = Actor {
        sub: actor_sub,
        client_id: actor_client,
        act: inherited.map(Box::new),
    };
    act = collapse_act(act);
    act
}

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let subject_token = ctx.require_param("subject_token")?;
    let subject_token_type = ctx.require_param("subject_token_type")?;
    let actor_token_type = ctx.param("actor_token_type");

    // Extension dispatch happens before the generic path: Native SSO pairs
    // an ID token with a device secret; ID-JAG asks for its own issued
    // token type.
    if subject_token_type == token_types::ID_TOKEN
        && actor_token_type == Some(token_types::DEVICE_SECRET)
    {
        return native_sso::execute(engine, ctx, tenant).await;
    }
    if ctx.param("requested_token_type") == Some(token_types::ID_JAG) {
        return id_jag::execute(engine, ctx, tenant).await;
    }

    if subject_token_type == token_types::REFRESH_TOKEN {
        return Err(OAuthError::invalid_request(
            "refresh_token is not accepted as a subject token",
        ));
    }
    let allowed_types = &tenant.token_exchange.allowed_subject_token_types;
    if !allowed_types
        .iter()
        .any(|t| t == subject_token_type || t == short_type(subject_token_type))
    {
        return Err(OAuthError::invalid_request(
            "Unsupported subject_token_type",
        ));
    }

    let resources = ctx.params_multi("resource");
    let audiences = ctx.params_multi("audience");
    if resources.len() as u64 > tenant.token_exchange.max_resource_params {
        return Err(OAuthError::invalid_request("Too many resource parameters"));
    }
    if audiences.len() as u64 > tenant.token_exchange.max_audience_params {
        return Err(OAuthError::invalid_request("Too many audience parameters"));
    }

    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;

    let subject: AccessClaims = engine
        .signer()
        .verify(subject_token, &VerifyOptions::default())
        .await?;

    if engine.revocations().is_revoked(&subject.jti).await.ok() == Some(true) {
        return Err(OAuthError::invalid_grant("Subject token has been revoked"));
    }

    // Audience authorization: the requesting client must appear in the
    // subject token's audience, or the subject's issuing client must be on
    // the requester's allow-list. There is no implicit self-trust: a client
    // re-presenting its own token still needs the allow-list entry.
    let audience_ok = subject.aud.contains(&client.client_id)
        || client
            .allowed_subject_token_clients
            .iter()
            .any(|c| c == &subject.client_id);
    if !audience_ok {
        return Err(OAuthError::invalid_target(
            "Client is not authorized for this subject token",
        ));
    }

    let granted_targets = resolve_targets(&client, &resources, &audiences)?;

    // granted = requested ∩ subject ∩ client-allowed; never a superset.
    let subject_scopes: Vec<&str> = subject.scope.split_whitespace().collect();
    let requested = ctx.param("scope").unwrap_or(&subject.scope);
    let granted_scope: String = requested
        .split_whitespace()
        .filter(|s| subject_scopes.contains(s))
        .filter(|s| client.allows_scope(s))
        .collect::<Vec<_>>()
        .join(" ");

    let actor = match ctx.param("actor_token") {
        Some(actor_token) => {
            let actor_claims: AccessClaims = engine
                .signer()
                .verify(actor_token, &VerifyOptions::default())
                .await?;
            build_actor(
                Some(actor_claims.sub),
                Some(actor_claims.client_id),
                subject.act.clone(),
            )
        }
        None => build_actor(
            Some(format!("client:{}", client.client_id)),
            Some(client.client_id.clone()),
            subject.act.clone(),
        ),
    };

    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims = engine.base_access_claims(
        &subject.sub,
        &client.client_id,
        &granted_scope,
        expires_in,
    );
    if !granted_targets.is_empty() {
        access_claims.aud = Audience::Multiple(granted_targets);
    }
    access_claims.act = Some(actor);
    access_claims.acr = subject.acr.clone();
    access_claims.amr = subject.amr.clone();
    access_claims.anonymous = subject.anonymous;
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client.client_id, "sub": subject.sub }),
    );

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.scope = Some(granted_scope);
    response.issued_token_type = Some(token_types::ACCESS_TOKEN.to_string());
    Ok(response)
}

/// Merge `resource` and `audience` into the granted audience set, enforced
/// against the client's exchange allow-list when one is registered.
pub fn resolve_targets(
    client: &ClientMetadata,
    resources: &[String],
    audiences: &[String],
) -> Result<Vec<String>, OAuthError> {
    let mut targets: Vec<String> = Vec::new();
    for target in resources.iter().chain(audiences.iter()) {
        if !targets.contains(target) {
            targets.push(target.clone());
        }
    }
    if client.allowed_token_exchange_resources.is_empty() {
        return Ok(targets);
    }
    for target in &targets {
        if !client
            .allowed_token_exchange_resources
            .iter()
            .any(|allowed| allowed == target)
        {
            return Err(OAuthError::invalid_target(
                "Requested resource is not allowed for this client",
            ));
        }
    }
    Ok(targets)
}
