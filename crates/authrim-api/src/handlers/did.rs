//! DID link management: challenge/verify proof-of-control, list and
//! unlink.

use crate::cookies::{read_cookie, SESSION_COOKIE};
use crate::error::ApiError;
use crate::AppState;
use authrim_core::OAuthError;
use authrim_crypto::random_token;
use authrim_store::{
    Challenge, ChallengeKind, ChallengeStore, LinkedIdentity, LinkedIdentityError,
    LinkedIdentityStore, SessionStore,
};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

const DID_PROVIDER: &str = "did";

async fn session_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let session_id = read_cookie(headers, SESSION_COOKIE)
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;
    let session = state
        .sessions
        .get(&session_id)
        .await
        .map_err(OAuthError::from)?
        .ok_or_else(|| OAuthError::invalid_grant("No active session"))?;
    Ok(session.user_id)
}

fn validate_did(did: &str) -> Result<(), ApiError> {
    if !did.starts_with("did:") || did.len() > 512 || did.split(':').count() < 3 {
        return Err(OAuthError::invalid_request("Malformed DID").into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DidChallengeRequest {
    pub did: String,
}

/// POST /auth/did/register/challenge
pub async fn register_challenge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DidChallengeRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_did(&body.did)?;
    let user_id = session_user(&state, &headers).await?;

    if state
        .linked_identities
        .find(DID_PROVIDER, &body.did)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?
        .is_some()
    {
        return Err(OAuthError::invalid_request("DID is already linked").into());
    }

    let nonce = random_token(32);
    let challenge = Challenge::new(ChallengeKind::DidRegistration, &body.did, Duration::seconds(300))
        .with_subject(user_id)
        .with_secret(nonce.clone());
    state
        .challenges
        .store(challenge)
        .await
        .map_err(OAuthError::from)?;

    Ok(Json(json!({ "nonce": nonce, "expires_in": 300 })))
}

#[derive(Debug, Deserialize)]
pub struct DidVerifyRequest {
    pub did: String,
    pub proof: Value,
}

/// POST /auth/did/register/verify — consume the challenge, check the
/// proof-of-control and link the identity.
pub async fn register_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DidVerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_did(&body.did)?;
    let user_id = session_user(&state, &headers).await?;

    let consumed = state
        .challenges
        .consume(ChallengeKind::DidRegistration, &body.did, None)
        .await
        .map_err(OAuthError::from)?;
    if consumed.subject_id.as_deref() != Some(user_id.as_str()) {
        return Err(OAuthError::invalid_grant("Challenge belongs to another session").into());
    }
    let nonce = consumed
        .secret_material
        .ok_or_else(|| OAuthError::server_error("DID challenge without nonce"))?;

    state
        .did_verifier
        .verify(&body.did, &nonce, &body.proof)
        .await
        .map_err(|_| OAuthError::access_denied("DID proof verification failed"))?;

    state
        .linked_identities
        .link(LinkedIdentity {
            user_id: user_id.clone(),
            provider_id: DID_PROVIDER.to_string(),
            provider_user_id: body.did.clone(),
            linked_at: Utc::now(),
            raw_attributes: body.proof,
        })
        .await
        .map_err(|e| match e {
            LinkedIdentityError::AlreadyLinked => {
                OAuthError::invalid_request("DID is already linked")
            }
            other => OAuthError::server_error(other.to_string()),
        })?;

    Ok(Json(json!({ "linked": true, "did": body.did })))
}

/// GET /auth/did/list
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user_id = session_user(&state, &headers).await?;
    let identities = state
        .linked_identities
        .list_by_user(&user_id)
        .await
        .map_err(|e| OAuthError::server_error(e.to_string()))?;
    let dids: Vec<Value> = identities
        .into_iter()
        .filter(|i| i.provider_id == DID_PROVIDER)
        .map(|i| {
            json!({
                "did": i.provider_user_id,
                "linked_at": i.linked_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({ "dids": dids })))
}

/// DELETE /auth/did/unlink/:did
pub async fn unlink(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(did): Path<String>,
) -> Result<Json<Value>, ApiError> {
    validate_did(&did)?;
    let user_id = session_user(&state, &headers).await?;
    state
        .linked_identities
        .unlink(&user_id, DID_PROVIDER, &did)
        .await
        .map_err(|e| match e {
            LinkedIdentityError::NotFound => OAuthError::invalid_request("DID is not linked"),
            other => OAuthError::server_error(other.to_string()),
        })?;
    Ok(Json(json!({ "unlinked": true })))
}
