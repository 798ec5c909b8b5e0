//! Client-initiated backchannel authentication (CIBA): poll/ping/push
//! requests keyed by `auth_req_id`, with an atomic issued flag so tokens
//! mint at most once.

use super::GrantEngine;
use crate::client_auth::authenticate_client;
use crate::error::OAuthError;
use crate::models::{TokenRequestContext, TokenResponse};
use authrim_config::TenantProfile;
use authrim_crypto::random_token;
use authrim_events::event_types;
use authrim_store::{Challenge, ChallengeError, ChallengeKind, ChallengeStore};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Poll,
    Ping,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CibaRequestData {
    pub client_id: String,
    pub scope: String,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub binding_message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub approved: Option<bool>,
    pub interval: u64,
    #[serde(default)]
    pub last_polled_at: Option<i64>,
    /// Flipped atomically before minting; precludes double issuance.
    #[serde(default)]
    pub token_issued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackchannelAuthResponse {
    pub auth_req_id: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// Begin a backchannel authentication request.
pub async fn start(
    engine: &GrantEngine,
    client_id: &str,
    scope: &str,
    delivery_mode: DeliveryMode,
    binding_message: Option<String>,
) -> Result<BackchannelAuthResponse, OAuthError> {
    let ttl = engine
        .config()
        .get_u64(authrim_config::keys::CIBA_REQUEST_TTL, 600)
        .await;
    let interval = engine
        .config()
        .get_u64(authrim_config::keys::CIBA_INTERVAL, 5)
        .await;

    let auth_req_id = random_token(32);
    let data = CibaRequestData {
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        delivery_mode,
        binding_message,
        user_id: None,
        approved: None,
        interval,
        last_polled_at: None,
        token_issued: false,
    };
    let challenge = Challenge::new(ChallengeKind::Ciba, &auth_req_id, Duration::seconds(ttl as i64))
        .with_metadata(
            serde_json::to_value(&data).map_err(|e| OAuthError::server_error(e.to_string()))?,
        );
    engine
        .challenges()
        .store(challenge)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    Ok(BackchannelAuthResponse {
        auth_req_id,
        expires_in: ttl,
        interval,
    })
}

/// Record the authenticating user's decision.
pub async fn decide(
    engine: &GrantEngine,
    auth_req_id: &str,
    user_id: &str,
    approved: bool,
) -> Result<(), OAuthError> {
    engine
        .challenges()
        .update(ChallengeKind::Ciba, auth_req_id, &move |challenge| {
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

pub async fn execute(
    engine: &GrantEngine,
    ctx: &TokenRequestContext,
    tenant: &TenantProfile,
) -> Result<TokenResponse, OAuthError> {
    let auth_req_id = ctx.require_param("auth_req_id")?;
    let (client, _) =
        authenticate_client(ctx, engine.clients().as_ref(), engine.issuer(), false).await?;

    let now = Utc::now().timestamp();
    let client_id = client.client_id.clone();
    // One atomic pass handles client binding, slow-down accounting,
    // approval state and the issued flag.
    let updated = engine
        .challenges()
        .update(ChallengeKind::Ciba, auth_req_id, &move |challenge| {
            let data: CibaRequestData = serde_json::from_value(challenge.metadata.clone())
                .map_err(|e| ChallengeError::StoreUnavailable(e.to_string()))?;
            if data.client_id != client_id {
                return Err(ChallengeError::ClientMismatch);
            }
            if data.token_issued {
                return Err(ChallengeError::AlreadyConsumed {
                    access_jti: None,
                    refresh_jti: None,
                });
            }
            if data.delivery_mode == DeliveryMode::Poll {
                if let Some(last) = data.last_polled_at {
                    if now - last < data.interval as i64 {
                        challenge.metadata["last_polled_at"] = json!(now);
                        return Err(ChallengeError::PredicateMismatch {
                            reason: "slow_down".into(),
                        });
                    }
                }
                challenge.metadata["last_polled_at"] = json!(now);
            }
            match data.approved {
                None => Err(ChallengeError::PredicateMismatch {
                    reason: "authorization_pending".into(),
                }),
                Some(false) => Err(ChallengeError::PredicateMismatch {
                    reason: "access_denied".into(),
                }),
                Some(true) => {
                    challenge.metadata["token_issued"] = json!(true);
                    Ok(())
                }
            }
        })
        .await;

    let challenge = match updated {
        Ok(challenge) => challenge,
        Err(ChallengeError::NotFound) => {
            return Err(OAuthError::invalid_grant("Unknown auth_req_id"))
        }
        Err(ChallengeError::Expired) => return Err(OAuthError::ExpiredToken),
        Err(ChallengeError::ClientMismatch) => {
            return Err(OAuthError::invalid_grant("Unknown auth_req_id"))
        }
        Err(ChallengeError::AlreadyConsumed { .. }) => {
            return Err(OAuthError::invalid_grant("Tokens already issued"))
        }
        Err(ChallengeError::PredicateMismatch { reason }) => {
            return Err(match reason.as_str() {
                "slow_down" => OAuthError::SlowDown,
                "access_denied" => OAuthError::access_denied("The user denied the request"),
                _ => OAuthError::AuthorizationPending,
            })
        }
        Err(other) => return Err(other.into()),
    };

    let data: CibaRequestData = serde_json::from_value(challenge.metadata.clone())
        .map_err(|e| OAuthError::server_error(e.to_string()))?;
    let user_id = data
        .user_id
        .clone()
        .ok_or_else(|| OAuthError::server_error("approved CIBA request without user"))?;

    // The issued flag is set; the record itself can go.
    let _ = engine
        .challenges()
        .delete(ChallengeKind::Ciba, auth_req_id)
        .await;

    let expires_in = engine.access_ttl(tenant).await;
    let mut access_claims =
        engine.base_access_claims(&user_id, &client.client_id, &data.scope, expires_in);
    access_claims.tenant = Some(tenant.tenant_id.clone());
    let access_jti = access_claims.jti.clone();
    let access_token = engine.signer().sign_access(&access_claims).await?;

    let id_token = if data.scope.split_whitespace().any(|s| s == "openid") {
        let mut id_claims = engine.base_id_claims(&user_id, &client.client_id, now, expires_in);
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
