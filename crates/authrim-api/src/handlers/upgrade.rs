//! Anonymous-to-full account upgrade.
//!
//! The upgrade nonce lives in the session data; completion either patches
//! the session in place (`preserve_sub = true`) or re-assigns the session
//! to a freshly minted full user.

use crate::cookies::{read_cookie, SESSION_COOKIE};
use crate::error::ApiError;
use crate::AppState;
use authrim_core::OAuthError;
use authrim_crypto::random_token;
use authrim_events::{event_types, EventBus};
use authrim_store::SessionStore;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

async fn current_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<authrim_store::Session, ApiError> {
    let session_id = read_cookie(headers, SESSION_COOKIE)
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;
    state
        .sessions
        .get(&session_id)
        .await
        .map_err(OAuthError::from)?
        .ok_or_else(|| OAuthError::invalid_grant("No active session").into())
}

/// POST /api/auth/upgrade — begin an upgrade, arming a one-shot nonce.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = current_session(&state, &headers).await?;
    if !session.is_anonymous() {
        return Err(OAuthError::invalid_request("Session is not anonymous").into());
    }
    if session
        .data
        .get("upgrade_eligible")
        .and_then(|v| v.as_bool())
        != Some(true)
    {
        return Err(OAuthError::access_denied("Session is not upgrade eligible").into());
    }

    let nonce = random_token(24);
    let mut patch = Map::new();
    patch.insert("upgrade_nonce".into(), json!(nonce));
    state
        .sessions
        .update_data(&session.id, patch)
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({ "upgrade_nonce": nonce })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteUpgrade {
    pub upgrade_nonce: String,
    pub verified_email: String,
    /// Keep the anonymous subject id (default) or mint a fresh user id.
    #[serde(default = "default_preserve_sub")]
    pub preserve_sub: bool,
}

fn default_preserve_sub() -> bool {
    true
}

/// POST /api/auth/upgrade/complete
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CompleteUpgrade>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant().await?;
    let session = current_session(&state, &headers).await?;

    let armed = session
        .data
        .get("upgrade_nonce")
        .and_then(|v| v.as_str());
    if armed != Some(body.upgrade_nonce.as_str()) {
        return Err(OAuthError::invalid_grant("Upgrade nonce mismatch").into());
    }

    let previous_user = session.user_id.clone();
    let user_id = if body.preserve_sub {
        previous_user.clone()
    } else {
        let new_user = format!("user_{}", random_token(12));
        state
            .sessions
            .update_user(&session.id, &new_user)
            .await
            .map_err(OAuthError::from)?;
        new_user
    };

    let mut patch = Map::new();
    patch.insert("is_anonymous".into(), json!(false));
    patch.insert("upgrade_eligible".into(), json!(false));
    patch.insert("upgrade_nonce".into(), Value::Null);
    patch.insert("verified_email".into(), json!(body.verified_email));
    patch.insert("amr".into(), json!(["email"]));
    state
        .sessions
        .update_data(&session.id, patch)
        .await
        .map_err(OAuthError::from)?;

    state.events.publish(
        event_types::USER_UPGRADED,
        &tenant.tenant_id,
        json!({
            "previous_user_id": previous_user,
            "user_id": user_id,
            "preserve_sub": body.preserve_sub,
        }),
    );

    Ok(Json(json!({ "user_id": user_id, "upgraded": true })))
}

/// GET /api/auth/upgrade/status
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = current_session(&state, &headers).await?;
    Ok(Json(json!({
        "is_anonymous": session.is_anonymous(),
        "upgrade_eligible": session
            .data
            .get("upgrade_eligible")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        "upgrade_pending": session.data.get("upgrade_nonce").is_some(),
    })))
}
