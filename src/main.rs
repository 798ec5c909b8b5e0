//! Main application entry point for the Authrim OP.

use anyhow::Result;
use authrim_api::{AppState, DidProofVerifier, PasskeyVerifier, TracingOtpDelivery};
use authrim_config::{AppSettings, ConfigProvider, TenantProfile};
use authrim_core::grants::jwt_bearer::TrustedIssuerTable;
use authrim_core::models::InMemoryClientRegistry;
use authrim_core::{GrantEngine, GrantEngineDeps, LogoutOrchestrator, RateLimiter};
use authrim_crypto::{KeyRing, SigningKey, TokenSigner};
use authrim_events::{
    AsyncAuditLogger, AuditLogger, AuditWorker, ChannelEventBus, EventBus, EventWorker,
    TracingAuditLogger, TracingEventBus, WaitUntil,
};
use authrim_crypto::KeyStore;
use authrim_store::FamilyMirror;
use secrecy::ExposeSecret;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authrim=debug,authrim_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Authrim OP");

    let environment =
        std::env::var("AUTHRIM__ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let settings = AppSettings::load("config", &environment)?;
    info!("Settings loaded for environment: {}", environment);

    // Durable KV (and L2 cache) behind the config provider.
    let cache = Arc::new(authrim_store::MultiLevelCache::new(
        settings.store.redis_url.as_deref(),
    )?);
    let config = Arc::new(ConfigProvider::new(cache.clone()));

    // Relational mirrors are optional; without MySQL they are no-ops.
    let mirror: Arc<dyn FamilyMirror> = match &settings.store.mysql_url {
        Some(url) => {
            let pool = MySqlPoolOptions::new()
                .max_connections(10)
                .connect(url.expose_secret())
                .await?;
            info!("MySQL mirror connected");
            Arc::new(authrim_store::TokenFamilyRepository::new(pool, "default"))
        }
        None => {
            info!("No MySQL configured, family mirror disabled");
            Arc::new(authrim_store::NoopFamilyMirror)
        }
    };

    // Key ring: a fresh signing key on boot; durable deployments load via
    // the key store instead.
    let signing_cache_ttl = config
        .get_u64(authrim_config::keys::KEYS_SIGNING_CACHE_TTL, 300)
        .await;
    let key_store = Arc::new(authrim_crypto::keyring::InMemoryKeyStore::new());
    key_store.put(SigningKey::generate_rs256()?).await?;
    let keyring = Arc::new(KeyRing::new(
        key_store,
        Duration::from_secs(signing_cache_ttl),
    ));

    let issuer = config
        .get_string(authrim_config::keys::ISSUER)
        .await
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let signer = Arc::new(TokenSigner::new(keyring.clone(), issuer.clone()));

    // Sharded authorization state.
    let challenge_shards = config
        .get_u64(authrim_config::keys::CHALLENGE_SHARD_COUNT, 16)
        .await as u32;
    let session_shards = config
        .get_u64(authrim_config::keys::SESSION_SHARD_COUNT, 16)
        .await as u32;
    let revocation_shards = config
        .get_u64(authrim_config::keys::REVOCATION_SHARD_COUNT, 16)
        .await as u32;
    let family_shards = config
        .get_u64(authrim_config::keys::REFRESH_SHARD_COUNT, 16)
        .await as u32;
    let generation = config
        .get_u64(authrim_config::keys::REFRESH_GENERATION, 1)
        .await as u32;

    let challenges = Arc::new(authrim_store::ShardedChallengeStore::new(challenge_shards));
    let sessions = Arc::new(authrim_store::ShardedSessionStore::new(session_shards));
    let session_clients = Arc::new(authrim_store::InMemorySessionClientIndex::new());
    let device_secrets = Arc::new(authrim_store::InMemoryDeviceSecretStore::new());
    let families = Arc::new(authrim_store::RefreshFamilyManager::new(
        family_shards,
        generation,
        mirror,
    ));
    let revocations = Arc::new(authrim_store::ShardedRevocationIndex::new(revocation_shards));

    let dpop_skew = config
        .get_u64(authrim_config::keys::DPOP_MAX_SKEW, 300)
        .await as i64;
    let dpop_window = config
        .get_u64(authrim_config::keys::DPOP_REPLAY_WINDOW, 600)
        .await;
    let dpop = Arc::new(authrim_crypto::DpopValidator::new(
        Arc::new(authrim_store::ShardedDpopReplayStore::new(challenge_shards)),
        dpop_skew,
        Duration::from_secs(dpop_window),
    ));

    let registry = Arc::new(InMemoryClientRegistry::new());
    let rate_limits = Arc::new(RateLimiter::new(cache.clone()));
    let wait_until = WaitUntil::new();

    // Events and audit drain through background workers.
    let (event_bus, event_rx) = ChannelEventBus::new(4096);
    let events: Arc<dyn EventBus> = Arc::new(event_bus);
    tokio::spawn(EventWorker::new(event_rx, Arc::new(TracingEventBus)).run());

    let (audit_logger, audit_rx) = AsyncAuditLogger::new(1024);
    let audit: Arc<dyn AuditLogger> = Arc::new(audit_logger);
    tokio::spawn(AuditWorker::new(audit_rx, Arc::new(TracingAuditLogger)).run());

    let trusted_issuers = Arc::new(TrustedIssuerTable::from_config(&config).await);

    let engine = Arc::new(GrantEngine::new(GrantEngineDeps {
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
        events: events.clone(),
        audit: audit.clone(),
        wait_until: wait_until.clone(),
        sso_replay: Arc::new(authrim_store::JtiReplayIndex::new(challenge_shards)),
        rate_limits: rate_limits.clone(),
        trusted_issuers,
        revocation_shards,
    }));

    let logout = Arc::new(LogoutOrchestrator::new(
        signer.clone(),
        sessions.clone(),
        session_clients,
        device_secrets,
        registry,
        events.clone(),
        audit.clone(),
        wait_until.clone(),
        config.clone(),
    ));

    // Fail fast on a broken tenant profile (e.g. rotation disabled in a
    // release build).
    TenantProfile::load(&config, "default").await?;

    let state = AppState {
        engine,
        logout,
        signer,
        keyring,
        sessions,
        challenges,
        anon_devices: Arc::new(authrim_store::InMemoryAnonymousDeviceStore::new()),
        linked_identities: Arc::new(authrim_store::InMemoryLinkedIdentityStore::new()),
        consents: Arc::new(authrim_store::InMemoryConsentStore::new()),
        config,
        rate_limits,
        events,
        audit,
        otp_delivery: Arc::new(TracingOtpDelivery),
        passkeys: Arc::new(RejectingPasskeyVerifier),
        did_verifier: Arc::new(RejectingDidVerifier),
    };

    let app = authrim_api::app(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {} (issuer {})", addr, issuer);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining background work");
            wait_until.shutdown(Duration::from_secs(30)).await;
            info!("Graceful shutdown complete");
        }
    }

    Ok(())
}

/// Ceremony verification plugs in per deployment; the default refuses.
struct RejectingPasskeyVerifier;

#[async_trait::async_trait]
impl PasskeyVerifier for RejectingPasskeyVerifier {
    async fn verify(&self, _nonce: &str, _response: &serde_json::Value) -> Result<String, String> {
        Err("no passkey verifier configured".to_string())
    }
}

struct RejectingDidVerifier;

#[async_trait::async_trait]
impl DidProofVerifier for RejectingDidVerifier {
    async fn verify(
        &self,
        _did: &str,
        _nonce: &str,
        _proof: &serde_json::Value,
    ) -> Result<(), String> {
        Err("no DID verifier configured".to_string())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
