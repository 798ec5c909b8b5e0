//! Session endpoints: ITP-mitigation token exchange, status, extension and
//! the OIDC check-session iframe.

use crate::cookies::{browser_state_cookie, read_cookie, session_cookie, SESSION_COOKIE};
use crate::error::ApiError;
use crate::AppState;
use authrim_core::OAuthError;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use authrim_crypto::random_token;
use authrim_store::{Challenge, ChallengeKind, ChallengeStore, SessionStore};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;

const SESSION_TOKEN_TTL_SECONDS: i64 = 60;

/// POST /auth/session/token — mint a one-shot token carrying the cookie
/// session across a storage-partitioned boundary.
pub async fn issue_session_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = read_cookie(&headers, SESSION_COOKIE)
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;
    let session = state
        .sessions
        .get(&session_id)
        .await
        .map_err(OAuthError::from)?
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;

    let token = random_token(24);
    let challenge = Challenge::new(
        ChallengeKind::SessionToken,
        &token,
        Duration::seconds(SESSION_TOKEN_TTL_SECONDS),
    )
    .with_subject(session.user_id.clone())
    .with_secret(session.id.clone());
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({
        "session_token": token,
        "expires_in": SESSION_TOKEN_TTL_SECONDS,
    })))
}

#[derive(Debug, Deserialize)]
pub struct VerifySessionToken {
    pub session_token: String,
}

/// POST /auth/session/verify — consume the one-shot token, re-establishing
/// the cookie in the new storage context.
pub async fn verify_session_token(
    State(state): State<AppState>,
    Json(body): Json<VerifySessionToken>,
) -> Result<Response, ApiError> {
    let consumed = state
        .challenges
        .consume(ChallengeKind::SessionToken, &body.session_token, None)
        .await
        .map_err(OAuthError::from)?;
    let session_id = consumed
        .secret_material
        .ok_or_else(|| OAuthError::server_error("session token without session id"))?;

    let session = state
        .sessions
        .get(&session_id)
        .await
        .map_err(OAuthError::from)?
        .ok_or_else(|| OAuthError::invalid_grant("Session no longer active"))?;

    let remaining = (session.expires_at - chrono::Utc::now()).num_seconds().max(0);
    let mut response = Json(json!({
        "verified": true,
        "user_id": session.user_id,
    }))
    .into_response();
    response
        .headers_mut()
        .append(SET_COOKIE, session_cookie(&session.id, remaining));
    response
        .headers_mut()
        .append(SET_COOKIE, browser_state_cookie(&random_token(12)));
    Ok(response)
}

/// GET /session/status
pub async fn session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(session_id) = read_cookie(&headers, SESSION_COOKIE) else {
        return Ok(Json(json!({ "active": false })));
    };
    match state.sessions.get(&session_id).await {
        Ok(Some(session)) => Ok(Json(json!({
            "active": true,
            "user_id": session.user_id,
            "expires_at": session.expires_at.to_rfc3339(),
            "is_anonymous": session.is_anonymous(),
        }))),
        _ => Ok(Json(json!({ "active": false }))),
    }
}

/// POST /session/refresh — extend the active session TTL.
pub async fn refresh_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = read_cookie(&headers, SESSION_COOKIE)
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;

    let ttl = state
        .config
        .get_u64(authrim_config::keys::SESSION_TTL, 3600)
        .await;
    let max_ttl = state
        .config
        .get_u64(authrim_config::keys::SESSION_MAX_TTL, 86_400)
        .await;

    let session = state
        .sessions
        .extend(
            &session_id,
            Duration::seconds(ttl as i64),
            Duration::seconds(max_ttl as i64),
        )
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({
        "extended": true,
        "expires_at": session.expires_at.to_rfc3339(),
    })))
}

/// GET /session/check — OIDC Session Management iframe. Compares the
/// client-supplied state against the `BROWSER_STATE` cookie.
pub async fn check_session_iframe() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>check session</title></head>
<body>
<script>
window.addEventListener("message", function (e) {
  var parts = (e.data || "").split(" ");
  var clientId = parts[0];
  var state = parts[1];
  var cookie = document.cookie.split("; ").find(function (c) {
    return c.indexOf("BROWSER_STATE=") === 0;
  });
  var browserState = cookie ? cookie.substring("BROWSER_STATE=".length) : "";
  var status = browserState && state === browserState ? "unchanged" : "changed";
  e.source.postMessage(status, e.origin);
}, false);
</script>
</body>
</html>"#,
    )
}
