//! RFC 8628 device-authorization grant: polling with `slow_down`, one-shot
//! consume on approval.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_events::event_types;
use authrim_store::{Challenge, ChallengeError, ChallengeKind, ChallengeStore};
use authrim_crypto::random_token;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthData {
    pub client_id: String,
    pub scope: String,
    pub user_code: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// `None` until the user acts; `Some(false)` on explicit denial.
    #[serde(default)]
    pub approved: Option<bool>,
    pub interval: u64,
    #[serde(default)]
    pub last_polled_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

fn user_code() -> String {
    // 8 chars from an unambiguous alphabet, XXXX-XXXX.
    const ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rand::random::<usize>() % ALPHABET.len();
        code.push(ALPHABET[idx] as char);
    }
    code
}

/// Begin a device flow (the device-authorization endpoint).
pub async fn start(
    engine: &GrantEngine,
    client_id: &str,
    scope: &str,
) -> Result<DeviceAuthorizationResponse, OAuthError> {
    let ttl = engine
        .config()
        .get_u64(authrim_config::keys::DEVICE_CODE_TTL, 1800)
        .await;
    let interval = engine
        .config()
        .get_u64(authrim_config::keys::DEVICE_CODE_INTERVAL, 5)
        .await;

    let device_code = random_token(32);
    let data = DeviceAuthData {
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        user_code: user_code(),
        user_id: None,
        approved: None,
        interval,
        last_polled_at: None,
    };
    let challenge = Challenge::new(
        ChallengeKind::DeviceAuth,
        &device_code,
        Duration::seconds(ttl as i64),
    )
    .with_metadata(serde_json::to_value(&data).map_err(|e| OAuthError::server_error(e.to_string()))?);
    engine
        .challenges()
        .store(challenge)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    Ok(DeviceAuthorizationResponse {
        device_code,
        user_code: data.user_code,
        verification_uri: format!("{}/device", engine.issuer()),
        expires_in: ttl,
        interval,
    })
}

/// Record the user's decision from the verification page.
pub async fn decide(
    engine: &GrantEngine,
    device_code: &str,
    user_id: &str,
    approved: bool,
) -> Result<(), OAuthError> {
    engine
        .challenges()
        .update(ChallengeKind::DeviceAuth, device_code, &move |challenge| {
            let obj = challenge
                .metadata
                .as_object_mut()
                .ok_or_else(|| ChallengeError::StoreUnavailable("malformed metadata".into()))?;
            obj.insert("approved".into(), json!(approved));
            obj.insert("user_id".into(), json!(user_id));
            Ok(())
        })
        .await
        .map_err(OAuthError::from)?;
    Ok(())
}

fn parse_data(challenge: &Challenge) -> Result<DeviceAuthData, OAuthError> {
    serde_json::from_value(challenge.metadata.clone())
        .map_err(|e| OAuthError::server_error(e.to_string()))
}

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let device_code = ctx.require_param("device_code")?;
    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), true).await?;

    let now = Utc::now().timestamp();
    // Poll-state bookkeeping happens atomically on the record; the closure
    // classifies the poll so the match below can answer without a second
    // read.
    let client_id = client.client_id.clone();
    let updated = engine
        .challenges()
        .update(ChallengeKind::DeviceAuth, device_code, &move |challenge| {
            let data: DeviceAuthData = serde_json::from_value(challenge.metadata.clone())
                .map_err(|e| ChallengeError::StoreUnavailable(e.to_string()))?;
            if data.client_id != client_id {
                return Err(ChallengeError::ClientMismatch);
            }
            if let Some(last) = data.last_polled_at {
                if now - last < data.interval as i64 {
                    // Recorded but still counts as a poll.
                    challenge.metadata["last_polled_at"] = json!(now);
                    return Err(ChallengeError::PredicateMismatch {
                        reason: "slow_down".into(),
                    });
                }
            }
            challenge.metadata["last_polled_at"] = json!(now);
            Ok(())
        })
        .await;

    let challenge = match updated {
        Ok(challenge) => challenge,
        Err(ChallengeError::NotFound) => {
            return Err(OAuthError::invalid_grant("Unknown device code"))
        }
        Err(ChallengeError::Expired) => return Err(OAuthError::ExpiredToken),
        Err(ChallengeError::ClientMismatch) => {
            return Err(OAuthError::invalid_grant("Unknown device code"))
        }
        Err(ChallengeError::PredicateMismatch { .. }) => return Err(OAuthError::SlowDown),
        Err(other) => return Err(other.into()),
    };

    let data = parse_data(&challenge)?;
    match data.approved {
        None => return Err(OAuthError::AuthorizationPending),
        Some(false) => return Err(OAuthError::access_denied("The user denied the request")),
        Some(true) => {}
    }
    let user_id = data
        .user_id
        .clone()
        .ok_or_else(|| OAuthError::server_error("approved device code without user"))?;

    // Approval consumes the code one-shot; concurrent polls race here and
    // exactly one mints.
    engine
        .challenges()
        .consume(ChallengeKind::DeviceAuth, device_code, None)
        .await
        .map_err(|_| OAuthError::invalid_grant("Unknown device code"))?;

    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims =
        engine.base_access_claims(&user_id, &client.client_id, &data.scope, expires_in);
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    let id_token = if data.scope.split_whitespace().any(|s| s == "openid") {
        let mut id_claims =
            engine.base_id_claims(&user_id, &client.client_id, now, expires_in);
        id_claims.at_hash = Some(GrantEngine::half_hash(&access_token));
        Some(engine.sign_id_token(&id_claims, &client).await?)
    } else {
        None
    };

    let refresh_ttl = engine.refresh_ttl().await;
    let head = engine.families().replace_family(
        &user_id,
        &client.client_id,
        &data.scope,
        Duration::seconds(refresh_ttl as i64),
    )?;
    let refresh_token = engine
        .sign_refresh_token(
            &user_id,
            &client.client_id,
            &data.scope,
            &head.jti,
            head.version,
            head.expires_at,
        )
        .await?;

    engine.emit(
        event_types::TOKEN_ACCESS_ISSUED,
        tenant,
        json!({ "jti": access_jti, "client_id": client.client_id, "sub": user_id }),
    );
    engine.emit(
        event_types::TOKEN_REFRESH_ISSUED,
        tenant,
        json!({ "jti": head.jti, "client_id": client.client_id, "sub": user_id }),
    );

    let mut response = TokenResponse::bearer(access_token, expires_in);
    response.refresh_token = Some(refresh_token);
    response.id_token = id_token;
    response.scope = Some(data.scope);
    Ok(response)
}
