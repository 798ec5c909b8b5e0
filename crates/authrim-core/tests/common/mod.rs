//! Shared wiring for grant-engine integration tests: every collaborator is
//! the in-memory implementation.

use authrim_config::{ConfigProvider, KvStore, MemoryKvStore, TenantProfile};
use authrim_core::grants::jwt_bearer::{TrustedIssuer, TrustedIssuerTable};
use authrim_core::models::{ClientMetadata, InMemoryClientRegistry, TokenRequestContext};
use authrim_core::rate_limit::RateLimiter;
use authrim_core::{GrantEngine, GrantEngineDeps};
use authrim_crypto::{DpopValidator, KeyRing, TokenSigner};
use authrim_events::{TracingAuditLogger, TracingEventBus, WaitUntil};
use authrim_store::{AuthCodeData, Challenge, ChallengeKind, ChallengeStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

pub const ISSUER: &str = "https://op.example";

pub struct TestHarness {
    pub engine: GrantEngine,
    pub signer: Arc<TokenSigner>,
    pub challenges: Arc<authrim_store::ShardedChallengeStore>,
    pub sessions: Arc<authrim_store::ShardedSessionStore>,
    pub session_clients: Arc<authrim_store::InMemorySessionClientIndex>,
    pub device_secrets: Arc<authrim_store::InMemoryDeviceSecretStore>,
    pub registry: Arc<InMemoryClientRegistry>,
    pub kv: Arc<MemoryKvStore>,
    pub config: Arc<ConfigProvider>,
}

pub async fn harness(kv_seed: &[(&str, &str)]) -> TestHarness {
    harness_with(kv_seed, Vec::new()).await
}

pub async fn harness_with(kv_seed: &[(&str, &str)], trusted: Vec<TrustedIssuer>) -> TestHarness {
    let kv = Arc::new(MemoryKvStore::new());
    for (key, value) in kv_seed {
        kv.put(key, value, None).await.unwrap();
    }
    let config = Arc::new(ConfigProvider::new(kv.clone()));

    let keyring = Arc::new(KeyRing::new_for_testing().await.unwrap());
    let signer = Arc::new(TokenSigner::new(keyring, ISSUER.to_string()));

    let challenges = Arc::new(authrim_store::ShardedChallengeStore::new(8));
    let sessions = Arc::new(authrim_store::ShardedSessionStore::new(8));
    let session_clients = Arc::new(authrim_store::InMemorySessionClientIndex::new());
    let device_secrets = Arc::new(authrim_store::InMemoryDeviceSecretStore::new());
    let families = Arc::new(authrim_store::RefreshFamilyManager::new(
        16,
        1,
        Arc::new(authrim_store::NoopFamilyMirror),
    ));
    let revocations = Arc::new(authrim_store::ShardedRevocationIndex::new(16));
    let dpop_replay = Arc::new(authrim_store::ShardedDpopReplayStore::new(8));
    let dpop = Arc::new(DpopValidator::new(
        dpop_replay,
        300,
        StdDuration::from_secs(600),
    ));
    let registry = Arc::new(InMemoryClientRegistry::new());

    let deps = GrantEngineDeps {
        signer: signer.clone(),
        challenges: challenges.clone(),
        sessions: sessions.clone(),
        session_clients: session_clients.clone(),
        families,
        revocations,
        device_secrets: device_secrets.clone(),
        dpop,
        clients: registry.clone(),
        config: config.clone(),
        events: Arc::new(TracingEventBus),
        audit: Arc::new(TracingAuditLogger),
        wait_until: WaitUntil::new(),
        sso_replay: Arc::new(authrim_store::JtiReplayIndex::new(8)),
        rate_limits: Arc::new(RateLimiter::new(kv.clone())),
        trusted_issuers: Arc::new(TrustedIssuerTable::new(trusted)),
        revocation_shards: 16,
    };

    TestHarness {
        engine: GrantEngine::new(deps),
        signer,
        challenges,
        sessions,
        session_clients,
        device_secrets,
        registry,
        kv,
        config,
    }
}

pub async fn tenant(harness: &TestHarness) -> TenantProfile {
    TenantProfile::load(&harness.config, "default").await.unwrap()
}

pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

pub fn demo_client() -> ClientMetadata {
    let mut client = ClientMetadata::confidential("demo-client", "demo-secret");
    client.redirect_uris = vec!["https://rp.example/cb".to_string()];
    client
}

/// Seed a consented authorization code the way the authorize handler
/// would.
pub async fn seed_auth_code(
    harness: &TestHarness,
    code: &str,
    client_id: &str,
    sid: Option<&str>,
) {
    let data = AuthCodeData {
        user_id: "user-1".to_string(),
        client_id: client_id.to_string(),
        scope: "openid profile".to_string(),
        redirect_uri: "https://rp.example/cb".to_string(),
        nonce: Some("n-0S6_WzA2Mj".to_string()),
        state: None,
        auth_time: chrono::Utc::now().timestamp() - 5,
        acr: None,
        amr: Some(vec!["pwd".to_string()]),
        dpop_jkt: None,
        sid: sid.map(String::from),
        authorization_details: None,
        code_challenge: authrim_crypto::s256(VERIFIER),
        code_challenge_method: "S256".to_string(),
        anonymous: false,
        issued_access_jti: None,
        issued_refresh_jti: None,
    };
    let challenge = Challenge::new(ChallengeKind::AuthCode, code, chrono::Duration::seconds(600))
        .with_subject("user-1")
        .with_metadata(serde_json::to_value(data).unwrap());
    harness.challenges.store(challenge).await.unwrap();
}

pub fn token_ctx(form: &[(&str, &str)]) -> TokenRequestContext {
    TokenRequestContext {
        method: "POST".to_string(),
        uri: format!("{ISSUER}/token"),
        authorization_header: None,
        dpop_proof: None,
        client_ip: Some("203.0.113.7".to_string()),
        form: form
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<String, String>>(),
    }
}

pub fn auth_code_form<'a>(code: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", "demo-client"),
        ("client_secret", "demo-secret"),
        ("redirect_uri", "https://rp.example/cb"),
        ("code_verifier", VERIFIER),
    ]
}
