//! Front- and back-channel logout scenarios.

mod common;

use authrim_config::TenantProfile;
use authrim_core::logout::LogoutOrchestrator;
use authrim_core::ClientMetadata;
use authrim_crypto::jwt::{IdClaims, LogoutClaims};
use authrim_events::{TracingAuditLogger, TracingEventBus, WaitUntil};
use authrim_store::{SessionClient, SessionClientIndex, SessionStore};
use common::*;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// One-shot HTTP capture: accepts a single request, returns its body.
async fn capture_server() -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let body = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let header = String::from_utf8_lossy(&buf[..pos]).to_string();
                let content_length: usize = header
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse().unwrap_or(0))
                    })
                    .unwrap_or(0);
                let mut body = buf[pos + 4..].to_vec();
                while body.len() < content_length {
                    let n = stream.read(&mut chunk).await.unwrap();
                    body.extend_from_slice(&chunk[..n]);
                }
                break String::from_utf8_lossy(&body).to_string();
            }
        };
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        let _ = tx.send(body);
    });

    (format!("http://{addr}/backchannel"), rx)
}

struct LogoutHarness {
    h: TestHarness,
    orchestrator: LogoutOrchestrator,
    wait_until: WaitUntil,
    tenant: TenantProfile,
}

async fn logout_harness() -> LogoutHarness {
    let h = harness(&[]).await;
    let tenant = tenant(&h).await;
    let wait_until = WaitUntil::new();
    let orchestrator = LogoutOrchestrator::new(
        h.signer.clone(),
        h.sessions.clone(),
        h.session_clients.clone(),
        h.device_secrets.clone(),
        h.registry.clone(),
        Arc::new(TracingEventBus),
        Arc::new(TracingAuditLogger),
        wait_until.clone(),
        h.config.clone(),
    );
    LogoutHarness {
        h,
        orchestrator,
        wait_until,
        tenant,
    }
}

async fn seed_session(h: &TestHarness, user: &str) -> String {
    let session = h
        .sessions
        .create(user, chrono::Duration::hours(1), Default::default())
        .await
        .unwrap();
    session.id
}

async fn id_token_hint(h: &TestHarness, sub: &str, aud: &str, sid: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = IdClaims {
        iss: ISSUER.to_string(),
        sub: sub.to_string(),
        aud: aud.to_string(),
        iat: now - 600,
        exp: now - 300, // expired hints are accepted for logout
        auth_time: now - 900,
        nonce: None,
        at_hash: None,
        c_hash: None,
        ds_hash: None,
        sid: Some(sid.to_string()),
        acr: None,
        amr: None,
        roles: None,
    };
    h.signer.sign_id(&claims).await.unwrap()
}

#[tokio::test]
async fn scenario_front_channel_logout_with_two_rps() {
    let lh = logout_harness().await;
    let sid = seed_session(&lh.h, "user-1").await;

    let (backchannel_url, captured) = capture_server().await;

    let mut rp1 = ClientMetadata::public("rp1");
    rp1.frontchannel_logout_uri = Some("https://rp1.example/fc-logout".to_string());
    rp1.frontchannel_logout_session_required = true;
    lh.h.registry.insert(rp1);

    let mut rp2 = ClientMetadata::confidential("rp2", "rp2-secret");
    rp2.backchannel_logout_uri = Some(backchannel_url.clone());
    rp2.backchannel_logout_session_required = true;
    rp2.post_logout_redirect_uris = vec!["https://rp2.example/after".to_string()];
    lh.h.registry.insert(rp2);

    for (client_id, front, back) in [
        ("rp1", Some("https://rp1.example/fc-logout"), None),
        ("rp2", None, Some(backchannel_url.as_str())),
    ] {
        lh.h.session_clients
            .register(SessionClient {
                session_id: sid.clone(),
                client_id: client_id.to_string(),
                backchannel_logout_uri: back.map(String::from),
                backchannel_logout_session_required: true,
                frontchannel_logout_uri: front.map(String::from),
                frontchannel_logout_session_required: true,
                webhook_url: None,
                webhook_secret_enc: None,
            })
            .await
            .unwrap();
    }

    let hint = id_token_hint(&lh.h, "user-1", "rp2", &sid).await;
    let outcome = lh
        .orchestrator
        .rp_initiated_logout(
            &lh.tenant,
            Some(&hint),
            Some("https://rp2.example/after"),
            Some("xyz"),
            None,
        )
        .await;

    assert!(outcome.session_destroyed);
    assert_eq!(outcome.frontchannel.len(), 1, "exactly one iframe, for rp1");
    let iframe = &outcome.frontchannel[0];
    assert_eq!(iframe.client_id, "rp1");
    assert!(iframe.uri.starts_with("https://rp1.example/fc-logout"));
    assert!(iframe.uri.contains("iss="));
    assert!(iframe.uri.contains(&format!("sid={sid}")));
    assert_eq!(outcome.redirect_to, "https://rp2.example/after");
    assert_eq!(outcome.state.as_deref(), Some("xyz"));

    // Exactly one signed logout token reaches rp2 in the background.
    lh.wait_until.shutdown(std::time::Duration::from_secs(5)).await;
    let body = captured.await.unwrap();
    let token = body
        .strip_prefix("logout_token=")
        .expect("form-encoded logout_token");
    let token: String = url::form_urlencoded::parse(format!("t={token}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let claims: LogoutClaims = lh
        .h
        .signer
        .verify(
            &token,
            &authrim_crypto::VerifyOptions {
                audience: Some("rp2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(claims.has_backchannel_event());
    assert_eq!(claims.sid.as_deref(), Some(sid.as_str()));

    let raw: serde_json::Value = lh.h.signer.peek_claims(&token).unwrap();
    assert!(raw.get("nonce").is_none(), "logout tokens never carry nonce");

    // The session and its associations are gone.
    assert!(lh.h.sessions.get(&sid).await.unwrap().is_none());
    assert!(lh.h.session_clients.collect(&sid).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_concurrent_logout_is_idempotent() {
    let lh = logout_harness().await;
    let sid = seed_session(&lh.h, "user-1").await;
    let hint = id_token_hint(&lh.h, "user-1", "rp1", &sid).await;
    lh.h.registry.insert(ClientMetadata::public("rp1"));

    let first = lh
        .orchestrator
        .rp_initiated_logout(&lh.tenant, Some(&hint), None, None, None)
        .await;
    let second = lh
        .orchestrator
        .rp_initiated_logout(&lh.tenant, Some(&hint), None, None, None)
        .await;

    assert!(first.session_destroyed);
    assert!(!second.session_destroyed, "second logout finds nothing to destroy");
}

#[tokio::test]
async fn scenario_invalid_redirect_falls_back_to_error_page() {
    let lh = logout_harness().await;
    let sid = seed_session(&lh.h, "user-1").await;
    let mut rp1 = ClientMetadata::public("rp1");
    rp1.post_logout_redirect_uris = vec!["https://rp1.example/registered".to_string()];
    lh.h.registry.insert(rp1);

    let hint = id_token_hint(&lh.h, "user-1", "rp1", &sid).await;
    let outcome = lh
        .orchestrator
        .rp_initiated_logout(
            &lh.tenant,
            Some(&hint),
            Some("https://evil.example/phish"),
            None,
            None,
        )
        .await;

    // Logged out regardless; only the redirect target changes.
    assert!(outcome.session_destroyed);
    assert!(outcome.redirect_to.contains("error=invalid_redirect_uri"));
}

#[tokio::test]
async fn scenario_unverified_hint_does_not_destroy_session() {
    let lh = logout_harness().await;
    let sid = seed_session(&lh.h, "user-1").await;

    // A forged hint naming a real sid: the signature check fails, so the
    // sid session survives (DoS guard).
    let forged = format!(
        "{}.{}.{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            r#"{"alg":"RS256","typ":"JWT"}"#
        ),
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            format!(r#"{{"iss":"{ISSUER}","sub":"user-1","aud":"rp1","sid":"{sid}","iat":0,"exp":0,"auth_time":0}}"#)
        ),
        "forged-signature"
    );

    let outcome = lh
        .orchestrator
        .rp_initiated_logout(&lh.tenant, Some(&forged), None, None, None)
        .await;
    assert!(!outcome.session_destroyed);
    assert!(lh.h.sessions.get(&sid).await.unwrap().is_some());
}

#[tokio::test]
async fn scenario_inbound_backchannel_logout() {
    let lh = logout_harness().await;
    let sid = seed_session(&lh.h, "user-1").await;

    let now = chrono::Utc::now().timestamp();
    let claims = LogoutClaims {
        iss: ISSUER.to_string(),
        sub: Some("user-1".to_string()),
        aud: "authrim-internal".to_string(),
        iat: now,
        exp: now + 120,
        jti: "lt-1".to_string(),
        events: LogoutClaims::backchannel_events(),
        sid: Some(sid.clone()),
    };
    let token = lh.h.signer.sign_logout(&claims).await.unwrap();

    lh.orchestrator
        .handle_backchannel_logout(&lh.tenant, &token)
        .await
        .unwrap();
    assert!(lh.h.sessions.get(&sid).await.unwrap().is_none());

    // Legacy (unrouteable) sid is a warning-level no-op.
    let legacy = LogoutClaims {
        sid: Some("legacy-session-id".to_string()),
        jti: "lt-2".to_string(),
        ..claims
    };
    let token = lh.h.signer.sign_logout(&legacy).await.unwrap();
    lh.orchestrator
        .handle_backchannel_logout(&lh.tenant, &token)
        .await
        .unwrap();
}

#[tokio::test]
async fn scenario_backchannel_logout_requires_events_and_rejects_nonce() {
    let lh = logout_harness().await;

    let now = chrono::Utc::now().timestamp();
    let mut missing_events = serde_json::json!({
        "iss": ISSUER,
        "sub": "user-1",
        "aud": "authrim-internal",
        "iat": now,
        "exp": now + 120,
        "jti": "lt-3",
        "events": {},
    });
    let token = sign_raw(&lh.h, &missing_events).await;
    let err = lh
        .orchestrator
        .handle_backchannel_logout(&lh.tenant, &token)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_request");

    missing_events["events"] = serde_json::json!({
        "http://schemas.openid.net/event/backchannel-logout": {}
    });
    missing_events["nonce"] = serde_json::json!("n-123");
    let token = sign_raw(&lh.h, &missing_events).await;
    let err = lh
        .orchestrator
        .handle_backchannel_logout(&lh.tenant, &token)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_request");
}

async fn sign_raw(h: &TestHarness, claims: &serde_json::Value) -> String {
    let logout: LogoutClaims = serde_json::from_value(claims.clone()).unwrap();
    let mut signed = h.signer.sign_logout(&logout).await.unwrap();
    if claims.get("nonce").is_some() {
        // LogoutClaims drops unknown members; re-sign with the nonce kept.
        let key = h.signer.keyring().active_signing_key().await.unwrap();
        let mut header = jsonwebtoken::Header::new(key.algorithm.jwt_algorithm());
        header.kid = Some(key.kid.clone());
        header.typ = Some("logout+jwt".to_string());
        signed = jsonwebtoken::encode(&header, claims, key.encoding_key()).unwrap();
    }
    signed
}
