//! The authorization_code grant: atomic code consume, PKCE, code-bound
//! DPoP, Native SSO device-secret issuance and replay revocation.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{ClientMetadata, ClientRegistry, TokenRequestContext, TokenResponse};
use authrim_config::{OverflowPolicy, TenantProfile};
use authrim_crypto::jwt::Confirmation;
use authrim_events::event_types;
use authrim_store::session_client::{encrypt_webhook_secret, SessionClient};
use authrim_store::{
    AuthCodeData, CapPolicy, ChallengeError, ChallengeStore, DeviceSecretStore,
    SessionClientIndex, TokenRevocationIndex,
};
use chrono::Duration;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::warn;

fn validate_code_shape(code: &str) -> Result<(), OAuthError> {
    if code.is_empty() || code.len() > 512 {
        return Err(OAuthError::invalid_request("Malformed code"));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(OAuthError::invalid_request("Malformed code"));
    }
    Ok(())
}

fn validate_client_id_shape(client_id: &str) -> Result<(), OAuthError> {
    if client_id.is_empty() || client_id.len() > 255 {
        return Err(OAuthError::invalid_request("Malformed client_id"));
    }
    Ok(())
}

async fn validate_redirect_uri(engine: &GrantEngine, uri: &str) -> Result<(), OAuthError> {
    let parsed = url::Url::parse(uri)
        .map_err(|_| OAuthError::invalid_request("Malformed redirect_uri"))?;
    let insecure_allowed = engine
        .config()
        .get_bool(authrim_config::keys::ALLOW_INSECURE_REDIRECTS, false)
        .await;
    let is_loopback = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    if parsed.scheme() != "https" && !insecure_allowed && !is_loopback {
        return Err(OAuthError::invalid_request("redirect_uri must use HTTPS"));
    }
    Ok(())
}

/// Revoke the tokens a replayed code previously produced, then surface a
/// generic `invalid_grant`.
async fn handle_replay(
    engine: &GrantEngine,
    tenant: &TenantProfile,
    access_jti: Option<String>,
    refresh_jti: Option<String>,
) -> OAuthError {
    let access_ttl = engine.access_ttl(tenant).await;
    let refresh_ttl = engine.refresh_ttl().await;
    if let Some(jti) = access_jti {
        if let Err(e) = engine
            .revocations()
            .revoke(
                &jti,
                Duration::seconds(access_ttl as i64),
                authrim_store::revocation_reasons::AUTH_CODE_REPLAY,
            )
            .await
        {
            warn!(error = %e, "failed to revoke replayed access token");
        }
    }
    if let Some(jti) = refresh_jti {
        if let Err(e) = engine
            .revocations()
            .revoke(
                &jti,
                Duration::seconds(refresh_ttl as i64),
                authrim_store::revocation_reasons::AUTH_CODE_REPLAY,
            )
            .await
        {
            warn!(error = %e, "failed to revoke replayed refresh token");
        }
    }
    OAuthError::invalid_grant("Invalid or expired code")
}

async fn maybe_issue_device_secret(
    engine: &GrantEngine,
    tenant: &TenantProfile,
    client: &ClientMetadata,
    code: &AuthCodeData,
) -> Result<Option<authrim_store::IssuedDeviceSecret>, OAuthError> {
    if !tenant.native_sso.enabled || !client.native_sso_enabled {
        return Ok(None);
    }
    let Some(sid) = &code.sid else {
        return Ok(None);
    };
    let policy = match tenant.native_sso.overflow_policy {
        OverflowPolicy::RevokeOldest => CapPolicy::RevokeOldest,
        OverflowPolicy::Reject => CapPolicy::Reject,
    };
    let issued = engine
        .device_secrets()
        .create(
            &code.user_id,
            sid,
            Duration::seconds(tenant.native_sso.device_secret_ttl_seconds as i64),
            tenant.native_sso.max_use_count,
            tenant.native_sso.per_user_cap,
            policy,
        )
        .await
        .map_err(|e| match e {
            authrim_store::DeviceSecretError::CapExceeded => {
                OAuthError::invalid_request("Device secret limit reached")
            }
            other => OAuthError::server_error(other.to_string()),
        })?;
    Ok(Some(issued))
}

async fn register_session_client(
    engine: &GrantEngine,
    sid: &str,
    client: &ClientMetadata,
) -> Result<(), OAuthError> {
    let webhook_secret_enc = match (&client.webhook_url, &client.webhook_secret) {
        (Some(_), Some(secret)) => {
            let key = engine
                .config()
                .get_string(authrim_config::keys::LOGOUT_WEBHOOK_SECRET_KEY)
                .await
                .and_then(|raw| {
                    use base64::Engine;
                    base64::engine::general_purpose::URL_SAFE_NO_PAD
                        .decode(raw)
                        .ok()
                })
                .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
            match key {
                Some(key) => Some(
                    encrypt_webhook_secret(&key, secret.expose_secret())
                        .map_err(|e| OAuthError::server_error(e.to_string()))?,
                ),
                None => {
                    warn!(client_id = %client.client_id, "webhook secret key unset, skipping webhook registration");
                    None
                }
            }
        }
        _ => None,
    };

    engine
        .session_clients()
        .register(SessionClient {
            session_id: sid.to_string(),
            client_id: client.client_id.clone(),
            backchannel_logout_uri: client.backchannel_logout_uri.clone(),
            backchannel_logout_session_required: client.backchannel_logout_session_required,
            frontchannel_logout_uri: client.frontchannel_logout_uri.clone(),
            frontchannel_logout_session_required: client.frontchannel_logout_session_required,
            webhook_url: client.webhook_url.clone(),
            webhook_secret_enc,
        })
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))
}

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let code = ctx.require_param("code")?;
    validate_code_shape(code)?;
    let claimed_client_id = ctx.require_param("client_id")?;
    validate_client_id_shape(claimed_client_id)?;
    let redirect_uri = ctx.require_param("redirect_uri")?;
    validate_redirect_uri(engine, redirect_uri).await?;
    let code_verifier = ctx.require_param("code_verifier")?;

    let client = engine
        .clients()
        .get(claimed_client_id)
        .await
        .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

    let dpop_required = tenant.require_dpop || tenant.fapi_enabled || client.require_dpop;
    if dpop_required && ctx.dpop_proof.is_none() {
        return Err(OAuthError::InvalidDpopProof {
            description: "DPoP proof is required".to_string(),
        });
    }

    // Pre-validate the proof before the one-shot consume so a bad proof
    // doesn't burn the code.
    let proof_jkt = engine.validate_dpop(ctx, claimed_client_id).await?;

    let code_data = match engine
        .challenges()
        .consume_auth_code(code, claimed_client_id, code_verifier)
        .await
    {
        Ok(data) => data,
        Err(ChallengeError::AlreadyConsumed {
            access_jti,
            refresh_jti,
        }) => return Err(handle_replay(engine, tenant, access_jti, refresh_jti).await),
        Err(other) => return Err(other.into()),
    };

    // The code is consumed from here on. Failures below intentionally do
    // not restore it; the client restarts authorization.
    if code_data.redirect_uri != redirect_uri {
        return Err(OAuthError::invalid_grant("redirect_uri mismatch"));
    }

    if let Some(bound_jkt) = &code_data.dpop_jkt {
        match &proof_jkt {
            Some(jkt) if jkt == bound_jkt => {}
            _ => {
                return Err(OAuthError::InvalidDpopProof {
                    description: "Proof key does not match the authorization code binding"
                        .to_string(),
                })
            }
        }
    }

    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;
    if client.client_id != code_data.client_id {
        return Err(OAuthError::invalid_grant("Invalid or expired code"));
    }

    let expires_in = engine.access_ttl(tenant).await;

    let mut access_claims = engine.base_access_claims(
        &code_data.user_id,
        &client.client_id,
        &code_data.scope,
        expires_in,
    );
    access_claims.cnf = proof_jkt.as_ref().map(|jkt| Confirmation { jkt: jkt.clone() });
    access_claims.authorization_details = code_data.authorization_details.clone();
    access_claims.acr = code_data.acr.clone();
    access_claims.amr = code_data.amr.clone();
    access_claims.anonymous = code_data.anonymous.then_some(true);
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    let at_hash = GrantEngine::half_hash(&access_token);

    // The wire form of a device secret is `{id}.{secret}`; ds_hash covers
    // exactly what the client receives.
    let device_secret = maybe_issue_device_secret(engine, tenant, &client, &code_data)
        .await?
        .map(|ds| format!("{}.{}", ds.id, ds.secret));

    let mut id_claims = engine.base_id_claims(
        &code_data.user_id,
        &client.client_id,
        code_data.auth_time,
        expires_in,
    );
    id_claims.nonce = code_data.nonce.clone();
    id_claims.at_hash = Some(at_hash);
    id_claims.acr = code_data.acr.clone();
    id_claims.amr = code_data.amr.clone();
    id_claims.sid = code_data.sid.clone();
    id_claims.ds_hash = device_secret.as_deref().map(GrantEngine::half_hash);
    let id_token = engine.sign_id_token(&id_claims, &client).await?;

    let refresh_ttl = engine.refresh_ttl().await;
    let head = engine
        .families()
        .replace_family(
            &code_data.user_id,
            &client.client_id,
            &code_data.scope,
            Duration::seconds(refresh_ttl as i64),
        )?;
    let refresh_token = engine
        .sign_refresh_token(
            &code_data.user_id,
            &client.client_id,
            &code_data.scope,
            &head.jti,
            head.version,
            head.expires_at,
        )
        .await?;

    engine
        .challenges()
        .register_issued_tokens(code, &access_jti, Some(&head.jti))
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    if let Some(sid) = &code_data.sid {
        register_session_client(engine, sid, &client).await?;
    }

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client.client_id, "sub": code_data.user_id }),
    );
    engine.emit(
        event_types::TOKEN_REFRESH_ISSUED,
        tenant,
        json!({ "jti": head.jti, "client_id": client.client_id, "sub": code_data.user_id }),
    );
    engine.emit(
        event_types::TOKEN_ID_ISSUED,
        tenant,
        json!({ "client_id": client.client_id, "sub": code_data.user_id }),
    );

    let mut response = if proof_jkt.is_some() {
        TokenResponse::sender_constrained(access_token, expires_in)
    } else {
        TokenResponse::bearer(access_token, expires_in)
    };
    response.refresh_token = Some(refresh_token);
    response.id_token = Some(id_token);
    response.scope = Some(code_data.scope.clone());
    response.device_secret = device_secret;
    Ok(response)
}
