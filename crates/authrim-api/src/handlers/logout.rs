//! Front-channel (GET /logout) and back-channel (POST /logout/backchannel)
//! logout endpoints.

use crate::cookies::{append_clearing_cookies, read_cookie, SESSION_COOKIE};
use crate::error::ApiError;
use crate::AppState;
use authrim_core::OAuthError;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct LogoutParams {
    pub id_token_hint: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    pub state: Option<String>,
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub async fn front_channel_logout(
    State(state): State<AppState>,
    Query(params): Query<LogoutParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = state.tenant().await?;
    let cookie_session = read_cookie(&headers, SESSION_COOKIE);

    let outcome = state
        .logout
        .rp_initiated_logout(
            &tenant,
            params.id_token_hint.as_deref(),
            params.post_logout_redirect_uri.as_deref(),
            params.state.as_deref(),
            cookie_session.as_deref(),
        )
        .await;

    let mut redirect_to = outcome.redirect_to.clone();
    if let Some(state_param) = &outcome.state {
        let sep = if redirect_to.contains('?') { '&' } else { '?' };
        redirect_to = format!(
            "{redirect_to}{sep}state={}",
            url::form_urlencoded::byte_serialize(state_param.as_bytes()).collect::<String>()
        );
    }

    let mut response = if outcome.frontchannel.is_empty() {
        Redirect::to(&redirect_to).into_response()
    } else {
        // One iframe per front-channel RP, then a delayed hop to the final
        // destination.
        let iframes: String = outcome
            .frontchannel
            .iter()
            .map(|target| {
                format!(
                    r#"<iframe src="{}" style="display:none"></iframe>"#,
                    escape_html(&target.uri)
                )
            })
            .collect();
        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="2;url={}">
<title>Signing out</title>
</head>
<body>
<p>Signing out…</p>
{}
</body>
</html>"#,
            escape_html(&redirect_to),
            iframes
        );
        Html(html).into_response()
    };

    append_clearing_cookies(response.headers_mut());
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct BackchannelLogoutForm {
    pub logout_token: String,
}

pub async fn back_channel_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<BackchannelLogoutForm>,
) -> Result<Response, ApiError> {
    let tenant = state.tenant().await?;

    // Confidential senders authenticate with Basic credentials.
    if let Some(authorization) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let ctx = authrim_core::models::TokenRequestContext {
            method: "POST".to_string(),
            uri: format!("{}/logout/backchannel", state.signer.issuer()),
            authorization_header: Some(authorization.to_string()),
            ..Default::default()
        };
        authrim_core::authenticate_client(
            &ctx,
            state.engine.clients().as_ref(),
            state.signer.issuer(),
            false,
        )
        .await
        .map_err(|_| OAuthError::invalid_client("Client authentication failed"))?;
    }

    state
        .logout
        .handle_backchannel_logout(&tenant, &form.logout_token)
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}
