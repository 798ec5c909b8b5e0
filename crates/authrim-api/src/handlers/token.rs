//! POST /token — the grant dispatcher endpoint.

use crate::error::ApiError;
use crate::AppState;
use authrim_core::models::TokenRequestContext;
use authrim_core::OAuthError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use axum::Json;
use std::collections::HashMap;

/// Parse `application/x-www-form-urlencoded`, folding repeated keys
/// (`resource`, `audience`) into newline-joined values for the engine.
fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let mut form: HashMap<String, String> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        form.entry(key.into_owned())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    form
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

pub async fn token(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/x-www-form-urlencoded") {
        return Err(OAuthError::invalid_request(
            "Content-Type must be application/x-www-form-urlencoded",
        )
        .into());
    }

    let tenant = state.tenant().await?;
    let ctx = TokenRequestContext {
        method: "POST".to_string(),
        uri: format!("{}{}", state.signer.issuer(), uri.path()),
        authorization_header: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        dpop_proof: headers
            .get("dpop")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        client_ip: client_ip(&headers),
        form: parse_form(&body),
    };

    let response = state.engine.handle_token(&ctx, &tenant).await?;
    Ok(Json(response))
}
