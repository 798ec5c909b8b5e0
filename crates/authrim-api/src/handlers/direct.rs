//! Direct-auth API: PKCE-gated passkey and email-code authentication that
//! terminates in a standard authorization-code exchange.
//!
//! Successful verification mints a real authorization code bound to the
//! caller-supplied PKCE challenge; `/direct/token` then rides the normal
//! grant engine.

use crate::cookies::{append_clearing_cookies, read_cookie, session_cookie, SESSION_COOKIE};
use crate::error::ApiError;
use crate::AppState;
use authrim_core::models::TokenRequestContext;
use authrim_core::rate_limit::rules;
use authrim_core::OAuthError;
use authrim_crypto::jwt::AccessClaims;
use authrim_crypto::{random_token, s256, VerifyOptions};
use authrim_events::{event_types, EventBus};
use authrim_store::{
    AuthCodeData, Challenge, ChallengeError, ChallengeKind, ChallengeStore, SessionStore,
    TokenRevocationIndex,
};
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::ValidateEmail;

/// Internal redirect target for codes produced by direct auth. Both the
/// code producer and `/direct/token` use it, so the standard redirect_uri
/// equality check holds.
const DIRECT_REDIRECT_URI: &str = "https://direct.authrim.internal/cb";

fn email_subject(email: &str) -> String {
    format!("email_{}", &s256(&email.to_ascii_lowercase())[..24])
}

fn validate_code_challenge(code_challenge: &str) -> Result<(), ApiError> {
    if code_challenge.len() != 43
        || !code_challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(OAuthError::invalid_request("Malformed code_challenge").into());
    }
    Ok(())
}

async fn mint_direct_code(
    state: &AppState,
    user_id: &str,
    client_id: &str,
    scope: &str,
    code_challenge: &str,
    amr: Vec<String>,
    sid: Option<String>,
) -> Result<String, ApiError> {
    let code = random_token(32);
    let ttl = state
        .config
        .get_u64(authrim_config::keys::AUTH_CODE_TTL, 600)
        .await;
    let data = AuthCodeData {
        user_id: user_id.to_string(),
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        redirect_uri: DIRECT_REDIRECT_URI.to_string(),
        nonce: None,
        state: None,
        auth_time: Utc::now().timestamp(),
        acr: None,
        amr: Some(amr),
        dpop_jkt: None,
        sid,
        authorization_details: None,
        code_challenge: code_challenge.to_string(),
        code_challenge_method: "S256".to_string(),
        anonymous: false,
        issued_access_jti: None,
        issued_refresh_jti: None,
    };
    let challenge = Challenge::new(ChallengeKind::AuthCode, &code, Duration::seconds(ttl as i64))
        .with_subject(user_id.to_string())
        .with_metadata(
            serde_json::to_value(data).map_err(|e| OAuthError::server_error(e.to_string()))?,
        );
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;
    Ok(code)
}

// ---------------------------------------------------------------------------
// Email one-time codes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EmailSendRequest {
    pub email: String,
}

/// POST /api/v1/auth/direct/email/send
pub async fn email_send(
    State(state): State<AppState>,
    Json(body): Json<EmailSendRequest>,
) -> Result<Json<Value>, ApiError> {
    if !body.email.validate_email() {
        return Err(OAuthError::invalid_request("Malformed email").into());
    }
    let subject = email_subject(&body.email);
    state.rate_limits.check(rules::OTP_SEND, &subject).await?;

    let code: String = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..6).map(|_| rng.gen_range(0..10).to_string()).collect()
    };
    let ttl = state
        .config
        .get_u64(authrim_config::keys::EMAIL_CODE_TTL, 600)
        .await;
    let max_attempts = state
        .config
        .get_u64(authrim_config::keys::EMAIL_CODE_MAX_ATTEMPTS, 5)
        .await;

    let challenge = Challenge::new(
        ChallengeKind::EmailCode,
        &subject,
        Duration::seconds(ttl as i64),
    )
    .with_subject(subject.clone())
    .with_secret(s256(&code))
    .with_max_attempts(max_attempts as u32);
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    state
        .otp_delivery
        .send_code(&body.email, &code)
        .await
        .map_err(|e| OAuthError::server_error(e))?;

    Ok(Json(json!({ "sent": true, "expires_in": ttl })))
}

#[derive(Debug, Deserialize)]
pub struct EmailVerifyRequest {
    pub email: String,
    pub code: String,
    pub client_id: String,
    pub code_challenge: String,
    #[serde(default)]
    pub scope: Option<String>,
}

/// POST /api/v1/auth/direct/email/verify — a correct code yields an
/// authorization code for `/direct/token`.
pub async fn email_verify(
    State(state): State<AppState>,
    Json(body): Json<EmailVerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_code_challenge(&body.code_challenge)?;
    let tenant = state.tenant().await?;
    let subject = email_subject(&body.email);
    state.rate_limits.check(rules::OTP_VERIFY, &subject).await?;

    if state.engine.clients().get(&body.client_id).await.is_none() {
        return Err(OAuthError::invalid_client("Unknown client").into());
    }

    let expected = s256(&body.code);
    let predicate = move |challenge: &Challenge| -> Result<(), ChallengeError> {
        if challenge.secret_material.as_deref() == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(ChallengeError::PredicateMismatch {
                reason: "code mismatch".into(),
            })
        }
    };
    state
        .challenges
        .consume(ChallengeKind::EmailCode, &subject, Some(&predicate))
        .await
        .map_err(OAuthError::from)?;

    let scope = body.scope.as_deref().unwrap_or("openid profile email");
    let code = mint_direct_code(
        &state,
        &subject,
        &body.client_id,
        scope,
        &body.code_challenge,
        vec!["otp".to_string(), "email".to_string()],
        None,
    )
    .await?;

    state.events.publish(
        event_types::AUTH_EMAIL_CODE_SUCCEEDED,
        &tenant.tenant_id,
        json!({ "user_id": subject }),
    );

    Ok(Json(json!({ "code": code })))
}

// ---------------------------------------------------------------------------
// Passkeys (ceremony verification is a collaborator)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PasskeyStartRequest {
    pub client_id: String,
    /// `login` or `register`.
    pub intent: String,
}

/// POST /api/v1/auth/direct/passkey/start
pub async fn passkey_start(
    State(state): State<AppState>,
    Json(body): Json<PasskeyStartRequest>,
) -> Result<Json<Value>, ApiError> {
    let kind = match body.intent.as_str() {
        "login" => ChallengeKind::PasskeyLogin,
        "register" => ChallengeKind::PasskeyRegister,
        _ => return Err(OAuthError::invalid_request("intent must be login or register").into()),
    };
    if state.engine.clients().get(&body.client_id).await.is_none() {
        return Err(OAuthError::invalid_client("Unknown client").into());
    }

    let challenge_id = random_token(16);
    let nonce = random_token(32);
    let challenge = Challenge::new(kind, &challenge_id, Duration::seconds(300))
        .with_secret(nonce.clone())
        .with_metadata(json!({ "client_id": body.client_id }));
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({
        "challenge_id": challenge_id,
        "challenge": nonce,
        "expires_in": 300,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PasskeyFinishRequest {
    pub challenge_id: String,
    pub intent: String,
    pub ceremony_response: Value,
    pub code_challenge: String,
    #[serde(default)]
    pub scope: Option<String>,
}

/// POST /api/v1/auth/direct/passkey/finish
pub async fn passkey_finish(
    State(state): State<AppState>,
    Json(body): Json<PasskeyFinishRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_code_challenge(&body.code_challenge)?;
    let tenant = state.tenant().await?;
    let kind = match body.intent.as_str() {
        "login" => ChallengeKind::PasskeyLogin,
        "register" => ChallengeKind::PasskeyRegister,
        _ => return Err(OAuthError::invalid_request("intent must be login or register").into()),
    };

    let consumed = state
        .challenges
        .consume(kind, &body.challenge_id, None)
        .await
        .map_err(OAuthError::from)?;
    let nonce = consumed
        .secret_material
        .ok_or_else(|| OAuthError::server_error("passkey challenge without nonce"))?;
    let client_id = consumed
        .metadata
        .get("client_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OAuthError::server_error("passkey challenge without client"))?
        .to_string();

    let user_id = match state.passkeys.verify(&nonce, &body.ceremony_response).await {
        Ok(user_id) => user_id,
        Err(reason) => {
            state.events.publish(
                event_types::AUTH_PASSKEY_FAILED,
                &tenant.tenant_id,
                json!({ "reason": reason }),
            );
            return Err(OAuthError::access_denied("Passkey verification failed").into());
        }
    };

    let scope = body.scope.as_deref().unwrap_or("openid profile");
    let code = mint_direct_code(
        &state,
        &user_id,
        &client_id,
        scope,
        &body.code_challenge,
        vec!["webauthn".to_string()],
        None,
    )
    .await?;

    state.events.publish(
        event_types::AUTH_PASSKEY_SUCCEEDED,
        &tenant.tenant_id,
        json!({ "user_id": user_id }),
    );

    Ok(Json(json!({ "code": code })))
}

// ---------------------------------------------------------------------------
// Token / session / logout
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DirectTokenRequest {
    pub code: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub code_verifier: String,
}

/// POST /api/v1/auth/direct/token — the direct-auth face of the standard
/// authorization_code grant.
pub async fn direct_token(
    State(state): State<AppState>,
    Json(body): Json<DirectTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant().await?;

    let mut form = std::collections::HashMap::new();
    form.insert("grant_type".to_string(), "authorization_code".to_string());
    form.insert("code".to_string(), body.code);
    form.insert("client_id".to_string(), body.client_id);
    if let Some(secret) = body.client_secret {
        form.insert("client_secret".to_string(), secret);
    }
    form.insert("redirect_uri".to_string(), DIRECT_REDIRECT_URI.to_string());
    form.insert("code_verifier".to_string(), body.code_verifier);

    let ctx = TokenRequestContext {
        method: "POST".to_string(),
        uri: format!("{}/api/v1/auth/direct/token", state.signer.issuer()),
        authorization_header: None,
        dpop_proof: None,
        client_ip: None,
        form,
    };
    let response = state.engine.handle_token(&ctx, &tenant).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| {
        OAuthError::server_error(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
pub struct DirectSessionRequest {
    pub access_token: String,
}

/// POST /api/v1/auth/direct/session — trade a fresh access token for a
/// browser session cookie.
pub async fn direct_session(
    State(state): State<AppState>,
    Json(body): Json<DirectSessionRequest>,
) -> Result<Response, ApiError> {
    let tenant = state.tenant().await?;
    let claims: AccessClaims = state
        .signer
        .verify(&body.access_token, &VerifyOptions::default())
        .await
        .map_err(OAuthError::from)?;

    if state
        .engine
        .revocations()
        .is_revoked(&claims.jti)
        .await
        .unwrap_or(false)
    {
        return Err(OAuthError::invalid_grant("Token has been revoked").into());
    }

    let ttl = state
        .config
        .get_u64(authrim_config::keys::SESSION_TTL, 3600)
        .await;
    let mut data = serde_json::Map::new();
    data.insert("client_id".into(), json!(claims.client_id));
    if let Some(amr) = &claims.amr {
        data.insert("amr".into(), json!(amr));
    }
    let session = state
        .sessions
        .create(&claims.sub, Duration::seconds(ttl as i64), data)
        .await
        .map_err(OAuthError::from)?;

    state.events.publish(
        event_types::SESSION_USER_CREATED,
        &tenant.tenant_id,
        json!({ "session_id": session.id, "user_id": claims.sub }),
    );

    let mut response = Json(json!({ "session_id": session.id })).into_response();
    response
        .headers_mut()
        .append(SET_COOKIE, session_cookie(&session.id, ttl as i64));
    Ok(response)
}

/// POST /api/v1/auth/direct/logout — invalidate the cookie session.
pub async fn direct_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = state.tenant().await?;
    if let Some(session_id) = read_cookie(&headers, SESSION_COOKIE) {
        let outcome = state
            .logout
            .rp_initiated_logout(&tenant, None, None, None, Some(&session_id))
            .await;
        if outcome.session_destroyed {
            tracing::info!(session_id, "direct logout destroyed session");
        }
    }
    let mut response = Json(json!({ "logged_out": true })).into_response();
    append_clearing_cookies(response.headers_mut());
    Ok(response)
}
