//! Logout orchestration: RP-initiated front-channel logout, signed
//! back-channel fan-out, webhook fan-out and inbound back-channel
//! notifications.
//!
//! The user is always logged out; validation failures only change the
//! redirect target. Fan-out runs on the wait-until pool after the
//! authoritative session invalidation.

use crate::error::OAuthError;
use crate::models::ClientRegistry;
use authrim_config::{ConfigProvider, TenantProfile};
use authrim_crypto::jwt::LogoutClaims;
use authrim_crypto::{random_token, TokenSigner, VerifyOptions};
use authrim_events::{event_types, AuditEvent, AuditLogger, EventBus, WaitUntil};
use authrim_store::session_client::decrypt_webhook_secret;
use authrim_store::{
    parse_session_shard, DeviceSecretStore, SessionClient, SessionClientIndex, SessionStore,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FrontChannelTarget {
    pub client_id: String,
    /// Fully composed iframe URI (`iss`, plus `sid` when required).
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct LogoutOutcome {
    /// One iframe per front-channel client.
    pub frontchannel: Vec<FrontChannelTarget>,
    /// Where the browser goes after the iframes load.
    pub redirect_to: String,
    pub state: Option<String>,
    /// Whether a live session was actually destroyed.
    pub session_destroyed: bool,
}

#[derive(Debug, Deserialize)]
struct HintClaims {
    sub: String,
    aud: String,
    #[serde(default)]
    sid: Option<String>,
}

pub struct LogoutOrchestrator {
    signer: Arc<TokenSigner>,
    sessions: Arc<dyn SessionStore>,
    session_clients: Arc<dyn SessionClientIndex>,
    device_secrets: Arc<dyn DeviceSecretStore>,
    clients: Arc<dyn ClientRegistry>,
    events: Arc<dyn EventBus>,
    audit: Arc<dyn AuditLogger>,
    wait_until: WaitUntil,
    config: Arc<ConfigProvider>,
    http: reqwest::Client,
}

impl LogoutOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<TokenSigner>,
        sessions: Arc<dyn SessionStore>,
        session_clients: Arc<dyn SessionClientIndex>,
        device_secrets: Arc<dyn DeviceSecretStore>,
        clients: Arc<dyn ClientRegistry>,
        events: Arc<dyn EventBus>,
        audit: Arc<dyn AuditLogger>,
        wait_until: WaitUntil,
        config: Arc<ConfigProvider>,
    ) -> Self {
        Self {
            signer,
            sessions,
            session_clients,
            device_secrets,
            clients,
            events,
            audit,
            wait_until,
            config,
            http: reqwest::Client::new(),
        }
    }

    /// RP-initiated logout (GET /logout).
    pub async fn rp_initiated_logout(
        &self,
        tenant: &TenantProfile,
        id_token_hint: Option<&str>,
        post_logout_redirect_uri: Option<&str>,
        state: Option<&str>,
        cookie_session_id: Option<&str>,
    ) -> LogoutOutcome {
        // Expired hints are fine for logout; a bad signature only means the
        // sid-session deletion is skipped (denial-of-service guard).
        let hint = match id_token_hint {
            Some(raw) => self
                .signer
                .verify::<HintClaims>(
                    raw,
                    &VerifyOptions {
                        allow_expired: true,
                        ..Default::default()
                    },
                )
                .await
                .ok(),
            None => None,
        };

        let mut rows: Vec<SessionClient> = Vec::new();
        let mut destroyed_user: Option<String> = None;
        let mut session_destroyed = false;

        // The browser-cookie session always goes.
        if let Some(cookie_sid) = cookie_session_id {
            if let Some((user, mut cookie_rows)) = self.destroy_session(tenant, cookie_sid).await {
                destroyed_user.get_or_insert(user);
                rows.append(&mut cookie_rows);
                session_destroyed = true;
            }
        }

        // The hinted sid only goes when the hint signature verified.
        if let Some(hint) = &hint {
            if let Some(sid) = &hint.sid {
                if Some(sid.as_str()) != cookie_session_id {
                    if let Some((user, mut sid_rows)) = self.destroy_session(tenant, sid).await {
                        destroyed_user.get_or_insert(user);
                        rows.append(&mut sid_rows);
                        session_destroyed = true;
                    }
                }
            }
        }

        if session_destroyed {
            let user = destroyed_user.clone().unwrap_or_default();
            self.events.publish(
                event_types::USER_LOGOUT,
                &tenant.tenant_id,
                json!({ "user_id": user }),
            );
            self.audit
                .log(
                    AuditEvent::new("user.logout", &tenant.tenant_id)
                        .with_actor(user)
                        .with_metadata(json!({ "clients_notified": rows.len() })),
                )
                .await;
        }

        // Partition by channel before any fan-out.
        let mut frontchannel = Vec::new();
        let mut backchannel = Vec::new();
        let mut webhooks = Vec::new();
        for row in rows {
            if row.frontchannel_logout_uri.is_some() {
                frontchannel.push(row.clone());
            }
            if row.backchannel_logout_uri.is_some() {
                backchannel.push(row.clone());
            }
            if row.webhook_url.is_some() {
                webhooks.push(row);
            }
        }

        let sub = destroyed_user.clone();
        self.spawn_backchannel_fanout(tenant, sub.clone(), backchannel);
        self.spawn_webhook_fanout(tenant, sub, webhooks);

        let redirect_to = self
            .resolve_post_logout_redirect(hint.as_ref(), post_logout_redirect_uri)
            .await;

        let iss = self.signer.issuer().to_string();
        let frontchannel = frontchannel
            .into_iter()
            .filter_map(|row| {
                let base = row.frontchannel_logout_uri?;
                let mut uri = url::Url::parse(&base).ok()?;
                uri.query_pairs_mut().append_pair("iss", &iss);
                if row.frontchannel_logout_session_required {
                    uri.query_pairs_mut().append_pair("sid", &row.session_id);
                }
                Some(FrontChannelTarget {
                    client_id: row.client_id,
                    uri: uri.to_string(),
                })
            })
            .collect();

        LogoutOutcome {
            frontchannel,
            redirect_to,
            state: state.map(String::from),
            session_destroyed,
        }
    }

    /// Invalidate one session and return (user, pre-collected rows). Only
    /// the caller that actually destroyed the live session gets rows back,
    /// which keeps concurrent logouts idempotent.
    async fn destroy_session(
        &self,
        tenant: &TenantProfile,
        session_id: &str,
    ) -> Option<(String, Vec<SessionClient>)> {
        if parse_session_shard(session_id).is_err() {
            warn!(session_id, "legacy session id in logout, skipping");
            return None;
        }

        let session = self.sessions.get(session_id).await.ok().flatten();
        let rows = self
            .session_clients
            .collect(session_id)
            .await
            .unwrap_or_default();

        let destroyed = self.sessions.invalidate(session_id).await.unwrap_or(false);
        if !destroyed {
            return None;
        }
        let _ = self.session_clients.remove_session(session_id).await;

        match self.device_secrets.revoke_for_session(session_id).await {
            Ok(revoked) if revoked > 0 => {
                info!(session_id, revoked, "revoked device secrets on logout");
            }
            Ok(_) => {}
            Err(e) => warn!(session_id, error = %e, "device secret revocation failed"),
        }

        self.events.publish(
            event_types::SESSION_USER_DESTROYED,
            &tenant.tenant_id,
            json!({ "session_id": session_id }),
        );
        self.audit
            .log(
                AuditEvent::new("session.destroyed", &tenant.tenant_id)
                    .with_resource(session_id.to_string()),
            )
            .await;

        let user = session.map(|s| s.user_id).unwrap_or_default();
        Some((user, rows))
    }

    async fn resolve_post_logout_redirect(
        &self,
        hint: Option<&HintClaims>,
        requested: Option<&str>,
    ) -> String {
        let error_page = self
            .config
            .get_string(authrim_config::keys::LOGOUT_DEFAULT_ERROR_PAGE)
            .await
            .unwrap_or_else(|| "/logout/error".to_string());

        let Some(requested) = requested else {
            return "/".to_string();
        };
        let Some(hint) = hint else {
            // No verified hint, no registered set to validate against.
            return format!("{error_page}?error=invalid_request");
        };
        match self.clients.get(&hint.aud).await {
            Some(client)
                if client
                    .post_logout_redirect_uris
                    .iter()
                    .any(|u| u == requested) =>
            {
                requested.to_string()
            }
            _ => format!("{error_page}?error=invalid_redirect_uri"),
        }
    }

    fn spawn_backchannel_fanout(
        &self,
        tenant: &TenantProfile,
        sub: Option<String>,
        rows: Vec<SessionClient>,
    ) {
        if rows.is_empty() {
            return;
        }
        let signer = self.signer.clone();
        let http = self.http.clone();
        let timeout = Duration::from_secs(tenant.logout.backchannel_timeout_seconds.max(1));
        let retries = tenant.logout.backchannel_retries;

        self.wait_until.spawn(async move {
            for row in rows {
                let Some(uri) = row.backchannel_logout_uri.clone() else {
                    continue;
                };
                let now = Utc::now().timestamp();
                let claims = LogoutClaims {
                    iss: signer.issuer().to_string(),
                    sub: sub.clone(),
                    aud: row.client_id.clone(),
                    iat: now,
                    exp: now + 120,
                    jti: random_token(12),
                    events: LogoutClaims::backchannel_events(),
                    sid: row
                        .backchannel_logout_session_required
                        .then(|| row.session_id.clone()),
                };
                let token = match signer.sign_logout(&claims).await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(client_id = %row.client_id, error = %e, "failed to sign logout token");
                        continue;
                    }
                };

                let mut attempt = 0;
                loop {
                    let result = http
                        .post(&uri)
                        .timeout(timeout)
                        .form(&[("logout_token", token.as_str())])
                        .send()
                        .await;
                    match result {
                        Ok(resp) if resp.status().is_success() => {
                            info!(client_id = %row.client_id, "back-channel logout delivered");
                            break;
                        }
                        Ok(resp) => {
                            warn!(client_id = %row.client_id, status = %resp.status(), "back-channel logout rejected");
                        }
                        Err(e) => {
                            warn!(client_id = %row.client_id, error = %e, "back-channel logout failed");
                        }
                    }
                    attempt += 1;
                    if attempt > retries {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200 * attempt)).await;
                }
            }
        });
    }

    fn spawn_webhook_fanout(
        &self,
        tenant: &TenantProfile,
        sub: Option<String>,
        rows: Vec<SessionClient>,
    ) {
        if rows.is_empty() {
            return;
        }
        let http = self.http.clone();
        let config = self.config.clone();
        let tenant_id = tenant.tenant_id.clone();

        self.wait_until.spawn(async move {
            let key = config
                .get_string(authrim_config::keys::LOGOUT_WEBHOOK_SECRET_KEY)
                .await
                .and_then(|raw| URL_SAFE_NO_PAD.decode(raw).ok())
                .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());

            for row in rows {
                let Some(url) = row.webhook_url.clone() else {
                    continue;
                };
                let body = json!({
                    "event": "user.logout",
                    "tenant_id": tenant_id,
                    "session_id": row.session_id,
                    "sub": sub,
                    "timestamp": Utc::now().to_rfc3339(),
                })
                .to_string();

                // The stored secret is decrypted only here, in the send
                // worker.
                let signature = match (&key, &row.webhook_secret_enc) {
                    (Some(key), Some(blob)) => match decrypt_webhook_secret(key, blob) {
                        Ok(secret) => {
                            let mac_key =
                                ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_bytes());
                            let tag = ring::hmac::sign(&mac_key, body.as_bytes());
                            Some(URL_SAFE_NO_PAD.encode(tag.as_ref()))
                        }
                        Err(e) => {
                            warn!(client_id = %row.client_id, error = %e, "webhook secret decrypt failed");
                            None
                        }
                    },
                    _ => None,
                };

                let mut request = http
                    .post(&url)
                    .timeout(Duration::from_secs(5))
                    .header("content-type", "application/json")
                    .body(body);
                if let Some(signature) = signature {
                    request = request.header("x-authrim-signature", signature);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(client_id = %row.client_id, "logout webhook delivered");
                    }
                    Ok(resp) => {
                        warn!(client_id = %row.client_id, status = %resp.status(), "logout webhook rejected");
                    }
                    Err(e) => {
                        warn!(client_id = %row.client_id, error = %e, "logout webhook failed");
                    }
                }
            }
        });
    }

    /// Inbound back-channel logout (POST /logout/backchannel).
    pub async fn handle_backchannel_logout(
        &self,
        tenant: &TenantProfile,
        logout_token: &str,
    ) -> Result<(), OAuthError> {
        let claims: LogoutClaims = self
            .signer
            .verify(logout_token, &VerifyOptions::default())
            .await
            .map_err(|_| OAuthError::invalid_grant("Logout token is not valid"))?;

        if !claims.has_backchannel_event() {
            return Err(OAuthError::invalid_request(
                "logout_token is missing the logout event",
            ));
        }
        if claims.sub.is_none() {
            return Err(OAuthError::invalid_request("logout_token requires sub"));
        }
        // A nonce marks an ID token, never a logout token.
        let raw: serde_json::Value = self
            .signer
            .peek_claims(logout_token)
            .map_err(|_| OAuthError::invalid_grant("Logout token is not valid"))?;
        if raw.get("nonce").is_some() {
            return Err(OAuthError::invalid_request(
                "logout_token must not carry a nonce",
            ));
        }

        match &claims.sid {
            Some(sid) if parse_session_shard(sid).is_ok() => {
                if let Some((_, _)) = self.destroy_session(tenant, sid).await {
                    info!(sid, "session invalidated by back-channel logout");
                }
                Ok(())
            }
            Some(sid) => {
                warn!(sid, "back-channel logout with unroutable sid, ignoring");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
