//! Anonymous device authentication: challenge/verify with device-bound,
//! HMAC-hashed identifiers.

use crate::cookies::session_cookie;
use crate::error::ApiError;
use crate::AppState;
use authrim_core::rate_limit::rules;
use authrim_core::OAuthError;
use authrim_crypto::{hmac_device_hash, random_token};
use authrim_events::{event_types, EventBus};
use authrim_store::{
    AnonymousDeviceStore, Challenge, ChallengeError, ChallengeKind, ChallengeStore,
    DeviceStability, SessionStore,
};
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;

async fn device_hash(state: &AppState, device_id: &str) -> String {
    let key = state
        .config
        .get_string(authrim_config::keys::ANON_DEVICE_HASH_KEY)
        .await
        .unwrap_or_else(|| "authrim-dev-device-key".to_string());
    hmac_device_hash(key.as_bytes(), device_id)
}

#[derive(Debug, Deserialize)]
pub struct AnonChallengeRequest {
    pub device_id: String,
    #[serde(default)]
    pub device_stability: Option<String>,
}

/// POST /api/auth/anon-login/challenge
pub async fn challenge(
    State(state): State<AppState>,
    Json(body): Json<AnonChallengeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.device_id.is_empty() || body.device_id.len() > 256 {
        return Err(OAuthError::invalid_request("Malformed device_id").into());
    }
    let hash = device_hash(&state, &body.device_id).await;
    state.rate_limits.check(rules::ANON_LOGIN, &hash).await?;

    let nonce = random_token(24);
    let challenge = Challenge::new(ChallengeKind::AnonLogin, &hash, Duration::seconds(120))
        .with_secret(nonce.clone())
        .with_metadata(json!({
            "device_stability": body.device_stability.clone().unwrap_or_else(|| "device".into()),
        }));
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({ "nonce": nonce, "expires_in": 120 })))
}

#[derive(Debug, Deserialize)]
pub struct AnonVerifyRequest {
    pub device_id: String,
    pub nonce: String,
}

/// POST /api/auth/anon-login/verify — consume the challenge, bind (or
/// rebind) the device row and open an anonymous session.
pub async fn verify(
    State(state): State<AppState>,
    Json(body): Json<AnonVerifyRequest>,
) -> Result<Response, ApiError> {
    let tenant = state.tenant().await?;
    let hash = device_hash(&state, &body.device_id).await;

    let nonce = body.nonce.clone();
    let predicate = move |challenge: &Challenge| -> Result<(), ChallengeError> {
        if challenge.secret_material.as_deref() == Some(nonce.as_str()) {
            Ok(())
        } else {
            Err(ChallengeError::PredicateMismatch {
                reason: "nonce mismatch".into(),
            })
        }
    };
    let consumed = state
        .challenges
        .consume(ChallengeKind::AnonLogin, &hash, Some(&predicate))
        .await
        .map_err(OAuthError::from)?;

    let stability = match consumed
        .metadata
        .get("device_stability")
        .and_then(|v| v.as_str())
    {
        Some("session") => DeviceStability::Session,
        Some("installation") => DeviceStability::Installation,
        _ => DeviceStability::Device,
    };

    // A stable device keeps its anonymous user across logins.
    let user_id = match state
        .anon_devices
        .get_active(&tenant.tenant_id, &hash)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
    {
        Some(existing) if stability != DeviceStability::Session => existing.user_id,
        _ => format!("anon_{}", random_token(12)),
    };
    state
        .anon_devices
        .upsert_active(&tenant.tenant_id, &user_id, &hash, stability, None)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    let ttl = state
        .config
        .get_u64(authrim_config::keys::SESSION_TTL, 3600)
        .await;
    let mut data = serde_json::Map::new();
    data.insert("is_anonymous".into(), json!(true));
    data.insert("upgrade_eligible".into(), json!(true));
    data.insert("amr".into(), json!(["anon"]));
    data.insert("device_id_hash".into(), json!(hash));
    let session = state
        .sessions
        .create(&user_id, Duration::seconds(ttl as i64), data)
        .await
        .map_err(OAuthError::from)?;

    state.events.publish(
        event_types::AUTH_LOGIN_SUCCEEDED,
        &tenant.tenant_id,
        json!({ "user_id": user_id, "anonymous": true }),
    );
    state.events.publish(
        event_types::SESSION_USER_CREATED,
        &tenant.tenant_id,
        json!({ "session_id": session.id, "user_id": user_id }),
    );

    let mut response = Json(json!({
        "user_id": user_id,
        "session_id": session.id,
        "is_anonymous": true,
    }))
    .into_response();
    response
        .headers_mut()
        .append(SET_COOKIE, session_cookie(&session.id, ttl as i64));
    Ok(response)
}
