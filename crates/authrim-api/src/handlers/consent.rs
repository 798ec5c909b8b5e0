//! Consent endpoints: the consent-screen data source and the approve/deny
//! transition that turns a login challenge into an authorization code.

use crate::error::ApiError;
use crate::AppState;
use authrim_core::OAuthError;
use authrim_crypto::random_token;
use authrim_events::{event_types, EventBus};
use authrim_store::{AuthCodeData, Challenge, ChallengeKind, ChallengeStore, ConsentStore};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Pending authorization request, parked while the user decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginChallengeData {
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    #[serde(default)]
    pub acr: Option<String>,
    #[serde(default)]
    pub amr: Option<Vec<String>>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub auth_time: Option<i64>,
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConsentQuery {
    pub challenge_id: String,
}

async fn load_challenge(
    state: &AppState,
    challenge_id: &str,
) -> Result<LoginChallengeData, ApiError> {
    let challenge = state
        .challenges
        .get(ChallengeKind::LoginChallenge, challenge_id)
        .await
        .map_err(OAuthError::from)?
        .ok_or_else(|| OAuthError::invalid_request("Unknown or expired challenge"))?;
    serde_json::from_value(challenge.metadata)
        .map_err(|e| OAuthError::server_error(e.to_string()).into())
}

/// GET /auth/consent — consent-screen data (JSON for API callers, a
/// minimal page otherwise).
pub async fn consent_data(
    State(state): State<AppState>,
    Query(query): Query<ConsentQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let data = load_challenge(&state, &query.challenge_id).await?;
    let client = state
        .engine
        .clients()
        .get(&data.client_id)
        .await
        .ok_or_else(|| OAuthError::invalid_request("Unknown client"))?;

    let scopes: Vec<&str> = data.scope.split_whitespace().collect();
    let existing = state
        .consents
        .find(&data.user_id, &data.client_id)
        .await
        .ok()
        .flatten();

    let payload = json!({
        "challenge_id": query.challenge_id,
        "client_id": data.client_id,
        "client_name": client.client_name,
        "scopes": scopes,
        "previously_granted": existing.map(|c| c.scope),
    });

    let wants_json = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);
    if wants_json {
        return Ok(Json(payload).into_response());
    }

    let name = payload["client_name"].as_str().unwrap_or(&data.client_id);
    Ok(Html(format!(
        "<!DOCTYPE html><html><body><h1>Authorize {}</h1><p>Requested scopes: {}</p></body></html>",
        escape(name),
        escape(&data.scope),
    ))
    .into_response())
}

fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// GET /auth/login-challenge — client metadata for a pending challenge.
pub async fn login_challenge(
    State(state): State<AppState>,
    Query(query): Query<ConsentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let data = load_challenge(&state, &query.challenge_id).await?;
    let client = state
        .engine
        .clients()
        .get(&data.client_id)
        .await
        .ok_or_else(|| OAuthError::invalid_request("Unknown client"))?;
    Ok(Json(json!({
        "client_id": client.client_id,
        "client_name": client.client_name,
        "redirect_uri": data.redirect_uri,
        "scope": data.scope,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConsentDecision {
    pub challenge_id: String,
    pub approved: bool,
    #[serde(default)]
    pub selected_scopes: Option<Vec<String>>,
    #[serde(default)]
    pub acknowledged_policy_versions: Option<AcknowledgedVersions>,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgedVersions {
    #[serde(default)]
    pub privacy_policy: Option<String>,
    #[serde(default)]
    pub tos: Option<String>,
}

/// POST /auth/consent — approve or deny; approval mints the one-shot
/// authorization code.
pub async fn consent_decision(
    State(state): State<AppState>,
    Json(decision): Json<ConsentDecision>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = state.tenant().await?;
    let consumed = state
        .challenges
        .consume(ChallengeKind::LoginChallenge, &decision.challenge_id, None)
        .await
        .map_err(OAuthError::from)?;
    let data: LoginChallengeData = serde_json::from_value(consumed.metadata)
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    let separator = if data.redirect_uri.contains('?') { '&' } else { '?' };
    let state_suffix = data
        .state
        .as_ref()
        .map(|s| {
            format!(
                "&state={}",
                url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>()
            )
        })
        .unwrap_or_default();

    if !decision.approved {
        state.events.publish(
            event_types::CONSENT_DENIED,
            &tenant.tenant_id,
            json!({ "user_id": data.user_id, "client_id": data.client_id }),
        );
        return Ok(Json(json!({
            "redirect_to": format!(
                "{}{}error=access_denied{}",
                data.redirect_uri, separator, state_suffix
            ),
        })));
    }

    // Narrowing to a subset of the requested scopes is the only selection
    // the screen offers.
    let granted_scope = match &decision.selected_scopes {
        Some(selected) => {
            let requested: Vec<&str> = data.scope.split_whitespace().collect();
            let narrowed: Vec<&str> = selected
                .iter()
                .map(String::as_str)
                .filter(|s| requested.contains(s))
                .collect();
            if narrowed.is_empty() {
                return Err(OAuthError::invalid_request("No valid scope selected").into());
            }
            narrowed.join(" ")
        }
        None => data.scope.clone(),
    };

    let versions = decision.acknowledged_policy_versions.as_ref();
    state
        .consents
        .grant(
            &data.user_id,
            &data.client_id,
            &data.scope,
            (granted_scope != data.scope).then_some(granted_scope.as_str()),
            versions.and_then(|v| v.privacy_policy.as_deref()),
            versions.and_then(|v| v.tos.as_deref()),
        )
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;

    let code = random_token(32);
    let code_ttl = state
        .config
        .get_u64(authrim_config::keys::AUTH_CODE_TTL, 600)
        .await;
    let code_data = AuthCodeData {
        user_id: data.user_id.clone(),
        client_id: data.client_id.clone(),
        scope: granted_scope,
        redirect_uri: data.redirect_uri.clone(),
        nonce: data.nonce.clone(),
        state: data.state.clone(),
        auth_time: data.auth_time.unwrap_or_else(|| Utc::now().timestamp()),
        acr: data.acr.clone(),
        amr: data.amr.clone(),
        dpop_jkt: None,
        sid: data.sid.clone(),
        authorization_details: None,
        code_challenge: data.code_challenge.clone(),
        code_challenge_method: data.code_challenge_method.clone(),
        anonymous: data.anonymous,
        issued_access_jti: None,
        issued_refresh_jti: None,
    };
    let challenge = Challenge::new(
        ChallengeKind::AuthCode,
        &code,
        Duration::seconds(code_ttl as i64),
    )
    .with_subject(data.user_id.clone())
    .with_metadata(serde_json::to_value(code_data).map_err(|e| OAuthError::server_error(e.to_string()))?);
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    state.events.publish(
        event_types::CONSENT_GRANTED,
        &tenant.tenant_id,
        json!({ "user_id": data.user_id, "client_id": data.client_id }),
    );

    Ok(Json(json!({
        "redirect_to": format!("{}{}code={}{}", data.redirect_uri, separator, code, state_suffix),
    })))
}
