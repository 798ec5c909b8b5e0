use crate::handlers::{anon, consent, did, direct, discovery, logout, session, token, upgrade};
use crate::middleware::{request_id_middleware, security_headers_middleware};
use crate::AppState;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(discovery::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(discovery::jwks))
        .route("/token", post(token::token))
        .route("/logout", get(logout::front_channel_logout))
        .route("/logout/backchannel", post(logout::back_channel_logout))
        .route(
            "/auth/consent",
            get(consent::consent_data).post(consent::consent_decision),
        )
        .route("/auth/login-challenge", get(consent::login_challenge))
        .route("/auth/session/token", post(session::issue_session_token))
        .route("/auth/session/verify", post(session::verify_session_token))
        .route("/session/status", get(session::session_status))
        .route("/session/refresh", post(session::refresh_session))
        .route("/session/check", get(session::check_session_iframe))
        .route("/api/auth/anon-login/challenge", post(anon::challenge))
        .route("/api/auth/anon-login/verify", post(anon::verify))
        .route("/api/auth/upgrade", post(upgrade::start))
        .route("/api/auth/upgrade/complete", post(upgrade::complete))
        .route("/api/auth/upgrade/status", get(upgrade::status))
        .route("/api/v1/auth/direct/email/send", post(direct::email_send))
        .route(
            "/api/v1/auth/direct/email/verify",
            post(direct::email_verify),
        )
        .route(
            "/api/v1/auth/direct/passkey/start",
            post(direct::passkey_start),
        )
        .route(
            "/api/v1/auth/direct/passkey/finish",
            post(direct::passkey_finish),
        )
        .route("/api/v1/auth/direct/token", post(direct::direct_token))
        .route("/api/v1/auth/direct/session", post(direct::direct_session))
        .route("/api/v1/auth/direct/logout", post(direct::direct_logout))
        .route(
            "/auth/did/register/challenge",
            post(did::register_challenge),
        )
        .route("/auth/did/register/verify", post(did::register_verify))
        .route("/auth/did/list", get(did::list))
        .route("/auth/did/unlink/:did", delete(did::unlink))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
