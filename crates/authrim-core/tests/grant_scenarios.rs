//! End-to-end grant scenarios over the fully wired engine with in-memory
//! collaborators.

mod common;

use authrim_core::models::token_types;
use authrim_core::ClientMetadata;
use authrim_crypto::jwt::{AccessClaims, IdClaims, RefreshClaims};
use authrim_crypto::{left_half_hash, VerifyOptions};
use authrim_store::{DeviceSecretStore, SessionClientIndex, TokenRevocationIndex};
use common::*;

#[tokio::test]
async fn scenario_auth_code_happy_path() {
    let h = harness(&[]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(demo_client());
    seed_auth_code(&h, "C1", "demo-client", Some("sess_00_abc")).await;

    let ctx = token_ctx(&auth_code_form("C1"));
    let response = h.engine.handle_token(&ctx, &tenant).await.unwrap();

    assert_eq!(response.token_type, "Bearer");
    assert!(response.expires_in > 0);

    let access: AccessClaims = h
        .signer
        .verify(&response.access_token, &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(access.sub, "user-1");
    assert_eq!(access.scope, "openid profile");
    assert_eq!(access.client_id, "demo-client");

    let id_token = response.id_token.as_deref().unwrap();
    let id: IdClaims = h
        .signer
        .verify(
            id_token,
            &VerifyOptions {
                audience: Some("demo-client".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(id.aud, "demo-client");
    assert_eq!(
        id.at_hash.as_deref(),
        Some(left_half_hash(&response.access_token).as_str()),
        "at_hash is the left half of SHA-256 over the access token"
    );
    assert_eq!(id.sid.as_deref(), Some("sess_00_abc"));
    assert_eq!(id.nonce.as_deref(), Some("n-0S6_WzA2Mj"));

    let refresh_jwt = response.refresh_token.as_deref().unwrap();
    let refresh: RefreshClaims = h.signer.peek_claims(refresh_jwt).unwrap();
    assert_eq!(refresh.rtv, 1);
    assert_eq!(refresh.aud, "demo-client");

    // The (sid, client) association is registered for logout.
    let rows = h.session_clients.collect("sess_00_abc").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].client_id, "demo-client");
}

#[tokio::test]
async fn scenario_auth_code_replay_revokes_issued_tokens() {
    let h = harness(&[]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(demo_client());
    seed_auth_code(&h, "C2", "demo-client", None).await;

    let ctx = token_ctx(&auth_code_form("C2"));
    let response = h.engine.handle_token(&ctx, &tenant).await.unwrap();
    let access: AccessClaims = h.signer.peek_claims(&response.access_token).unwrap();
    let refresh: RefreshClaims = h
        .signer
        .peek_claims(response.refresh_token.as_deref().unwrap())
        .unwrap();

    // Replay of the exact same request.
    let err = h.engine.handle_token(&ctx, &tenant).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_grant");

    let access_entry = h
        .engine
        .revocations()
        .entry(&access.jti)
        .await
        .unwrap()
        .expect("replayed access jti revoked");
    assert_eq!(access_entry.reason, "auth_code_replay");

    let refresh_entry = h
        .engine
        .revocations()
        .entry(&refresh.jti)
        .await
        .unwrap()
        .expect("replayed refresh jti revoked");
    assert_eq!(refresh_entry.reason, "auth_code_replay");
}

#[tokio::test]
async fn scenario_refresh_rotation_and_theft() {
    let h = harness(&[]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(demo_client());
    seed_auth_code(&h, "C3", "demo-client", None).await;

    let ctx = token_ctx(&auth_code_form("C3"));
    let initial = h.engine.handle_token(&ctx, &tenant).await.unwrap();
    let rt1 = initial.refresh_token.unwrap();

    // Holder A rotates: 1 -> 2.
    let rotate = |token: String| {
        vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), token),
            ("client_id".to_string(), "demo-client".to_string()),
            ("client_secret".to_string(), "demo-secret".to_string()),
        ]
    };
    let form = rotate(rt1.clone());
    let form_refs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let rotated = h
        .engine
        .handle_token(&token_ctx(&form_refs), &tenant)
        .await
        .unwrap();
    let rt2 = rotated.refresh_token.unwrap();
    let rt2_claims: RefreshClaims = h.signer.peek_claims(&rt2).unwrap();
    assert_eq!(rt2_claims.rtv, 2);

    // Holder B replays RT1: theft detected, family revoked.
    let form = rotate(rt1);
    let form_refs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let err = h
        .engine
        .handle_token(&token_ctx(&form_refs), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_grant");
    assert_eq!(err.public_description(), "Refresh token has been revoked");

    // Holder A's RT2 is dead too.
    let form = rotate(rt2);
    let form_refs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let err = h
        .engine
        .handle_token(&token_ctx(&form_refs), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_grant");
    assert_eq!(err.public_description(), "Refresh token has been revoked");
}

#[tokio::test]
async fn scenario_native_sso_cross_client_requires_all_three_flags() {
    let h = harness(&[
        ("nativeSso.enabled", "true"),
        ("nativeSso.allowCrossClient", "true"),
        ("oidc.tokenExchange.enabled", "true"),
    ])
    .await;
    let tenant = tenant(&h).await;

    let mut app_a = ClientMetadata::confidential("app-a", "secret-a");
    app_a.native_sso_enabled = true;
    app_a.allow_cross_client_native_sso = false; // originating client refuses
    h.registry.insert(app_a);

    let mut app_b = ClientMetadata::confidential("app-b", "secret-b");
    app_b.native_sso_enabled = true;
    app_b.allow_cross_client_native_sso = true;
    h.registry.insert(app_b);

    // App A obtained a device secret and an ID token for user-1.
    let issued = h
        .device_secrets
        .create(
            "user-1",
            "sess_00_aaa",
            chrono::Duration::days(90),
            1000,
            10,
            authrim_store::CapPolicy::RevokeOldest,
        )
        .await
        .unwrap();

    let now = chrono::Utc::now().timestamp();
    let id_claims = IdClaims {
        iss: ISSUER.to_string(),
        sub: "user-1".to_string(),
        aud: "app-a".to_string(),
        iat: now,
        exp: now + 900,
        auth_time: now - 30,
        nonce: None,
        at_hash: None,
        c_hash: None,
        ds_hash: None,
        sid: Some("sess_00_aaa".to_string()),
        acr: None,
        amr: None,
        roles: None,
    };
    let id_token = h.signer.sign_id(&id_claims).await.unwrap();
    let actor_token = format!("{}.{}", issued.id, issued.secret);

    // App B asks to exchange cross-client; App A never opted in.
    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", id_token.as_str()),
        ("subject_token_type", token_types::ID_TOKEN),
        ("actor_token", actor_token.as_str()),
        ("actor_token_type", token_types::DEVICE_SECRET),
        ("client_id", "app-b"),
        ("client_secret", "secret-b"),
    ];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_target");
}

#[tokio::test]
async fn scenario_native_sso_same_client_succeeds() {
    let h = harness(&[
        ("nativeSso.enabled", "true"),
        ("oidc.tokenExchange.enabled", "true"),
    ])
    .await;
    let tenant = tenant(&h).await;

    let mut app_a = ClientMetadata::confidential("app-a", "secret-a");
    app_a.native_sso_enabled = true;
    h.registry.insert(app_a);

    let issued = h
        .device_secrets
        .create(
            "user-1",
            "sess_00_aaa",
            chrono::Duration::days(90),
            1000,
            10,
            authrim_store::CapPolicy::RevokeOldest,
        )
        .await
        .unwrap();

    let now = chrono::Utc::now().timestamp();
    let id_claims = IdClaims {
        iss: ISSUER.to_string(),
        sub: "user-1".to_string(),
        aud: "app-a".to_string(),
        iat: now,
        exp: now + 900,
        auth_time: now - 30,
        nonce: None,
        at_hash: None,
        c_hash: None,
        ds_hash: None,
        sid: Some("sess_00_aaa".to_string()),
        acr: None,
        amr: None,
        roles: None,
    };
    let id_token = h.signer.sign_id(&id_claims).await.unwrap();
    let actor_token = format!("{}.{}", issued.id, issued.secret);

    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", id_token.as_str()),
        ("subject_token_type", token_types::ID_TOKEN),
        ("actor_token", actor_token.as_str()),
        ("actor_token_type", token_types::DEVICE_SECRET),
        ("client_id", "app-a"),
        ("client_secret", "secret-a"),
    ];
    let response = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap();

    assert!(response.id_token.is_some());
    assert!(response.refresh_token.is_some());
    let id: IdClaims = h
        .signer
        .peek_claims(response.id_token.as_deref().unwrap())
        .unwrap();
    assert_eq!(
        id.ds_hash.as_deref(),
        Some(left_half_hash(&actor_token).as_str())
    );

    // Replaying the same ID token within the window is blocked.
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_grant");
}

#[tokio::test]
async fn scenario_token_exchange_audience_intersection() {
    let h = harness(&[("oidc.tokenExchange.enabled", "true")]).await;
    let tenant = tenant(&h).await;

    let mut client = demo_client();
    client.allowed_token_exchange_resources = vec!["https://api.a".to_string()];
    // Self-exchange is not implicit; the issuing client must be
    // allow-listed like any other.
    client.allowed_subject_token_clients = vec!["demo-client".to_string()];
    h.registry.insert(client);

    // Subject token issued to demo-client by this OP.
    seed_auth_code(&h, "C6", "demo-client", None).await;
    let initial = h
        .engine
        .handle_token(&token_ctx(&auth_code_form("C6")), &tenant)
        .await
        .unwrap();

    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", initial.access_token.as_str()),
        ("subject_token_type", token_types::ACCESS_TOKEN),
        ("resource", "https://api.a\nhttps://api.b"),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
    ];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_target");

    // Restricted to the allowed resource, the exchange succeeds and the
    // granted audience is exactly it.
    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", initial.access_token.as_str()),
        ("subject_token_type", token_types::ACCESS_TOKEN),
        ("resource", "https://api.a"),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
    ];
    let response = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap();
    assert_eq!(
        response.issued_token_type.as_deref(),
        Some(token_types::ACCESS_TOKEN)
    );
    let access: AccessClaims = h.signer.peek_claims(&response.access_token).unwrap();
    assert!(access.aud.contains("https://api.a"));
    assert!(!access.aud.contains("https://api.b"));
    assert!(access.act.is_some(), "exchange records the acting party");
}

#[tokio::test]
async fn scenario_token_exchange_denies_unlisted_self_exchange() {
    let h = harness(&[("oidc.tokenExchange.enabled", "true")]).await;
    let tenant = tenant(&h).await;
    // No allowed_subject_token_clients entry at all.
    h.registry.insert(demo_client());

    seed_auth_code(&h, "C8", "demo-client", None).await;
    let initial = h
        .engine
        .handle_token(&token_ctx(&auth_code_form("C8")), &tenant)
        .await
        .unwrap();

    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", initial.access_token.as_str()),
        ("subject_token_type", token_types::ACCESS_TOKEN),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
    ];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_target");
}

#[tokio::test]
async fn scenario_refresh_token_never_accepted_as_subject() {
    let h = harness(&[("oidc.tokenExchange.enabled", "true")]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(demo_client());
    seed_auth_code(&h, "C7", "demo-client", None).await;

    let initial = h
        .engine
        .handle_token(&token_ctx(&auth_code_form("C7")), &tenant)
        .await
        .unwrap();
    let refresh_token = initial.refresh_token.unwrap();

    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ),
        ("subject_token", refresh_token.as_str()),
        ("subject_token_type", token_types::REFRESH_TOKEN),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
    ];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_request");
}

#[tokio::test]
async fn scenario_client_credentials() {
    let h = harness(&[]).await;
    let tenant = tenant(&h).await;
    let mut client = ClientMetadata::confidential("svc", "svc-secret");
    client.allowed_scopes = vec!["read:items".to_string(), "write:items".to_string()];
    h.registry.insert(client);

    let form = vec![
        ("grant_type", "client_credentials"),
        ("client_id", "svc"),
        ("client_secret", "svc-secret"),
        ("scope", "read:items admin"),
    ];
    let response = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap();
    assert!(response.refresh_token.is_none());
    assert!(response.id_token.is_none());
    assert_eq!(response.scope.as_deref(), Some("read:items"));

    let access: AccessClaims = h.signer.peek_claims(&response.access_token).unwrap();
    assert_eq!(access.sub, "client:svc");

    // Public clients are refused outright.
    h.registry.insert(ClientMetadata::public("spa"));
    let form = vec![("grant_type", "client_credentials"), ("client_id", "spa")];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_client");
}

#[tokio::test]
async fn scenario_device_code_flow() {
    use authrim_core::grants::device_code;

    let h = harness(&[("challenge.device_code_interval_seconds", "1")]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(ClientMetadata::public("tv-app"));

    let started = device_code::start(&h.engine, "tv-app", "openid profile")
        .await
        .unwrap();
    assert!(started.user_code.contains('-'));

    let form = vec![
        (
            "grant_type",
            "urn:ietf:params:oauth:grant-type:device_code",
        ),
        ("device_code", started.device_code.as_str()),
        ("client_id", "tv-app"),
    ];

    // Pending before the user acts.
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "authorization_pending");

    // Polling again inside the interval slows the device down.
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "slow_down");

    device_code::decide(&h.engine, &started.device_code, "user-9", true)
        .await
        .unwrap();

    // Wait out the polling interval, then collect tokens.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let response = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap();
    assert!(response.refresh_token.is_some());
    let access: AccessClaims = h.signer.peek_claims(&response.access_token).unwrap();
    assert_eq!(access.sub, "user-9");

    // The code was consumed one-shot.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_grant");
}

#[tokio::test]
async fn scenario_tenant_profile_gates_grants() {
    let h = harness(&[("tenant.allows_refresh_token", "false")]).await;
    let tenant = tenant(&h).await;
    h.registry.insert(demo_client());

    let form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", "anything"),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
    ];
    let err = h
        .engine
        .handle_token(&token_ctx(&form), &tenant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "unauthorized_client");
}
