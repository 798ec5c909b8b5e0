//! HTTP surface: token endpoint, logout endpoints, session management,
//! consent, anonymous device auth, direct auth and DID link management.

pub mod cookies;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;

use authrim_config::{ConfigProvider, TenantProfile};
use authrim_core::{GrantEngine, LogoutOrchestrator, RateLimiter};
use authrim_crypto::{KeyRing, TokenSigner};
use authrim_events::{AuditLogger, EventBus};
use authrim_store::{
    AnonymousDeviceStore, ChallengeStore, ConsentStore, LinkedIdentityStore, SessionStore,
};
use std::sync::Arc;

pub use router::app;

/// Email one-time-code delivery collaborator. Transport lives elsewhere;
/// the engine only hands over the code.
#[async_trait::async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), String>;
}

/// Logs instead of sending. Default for tests and development.
pub struct TracingOtpDelivery;

#[async_trait::async_trait]
impl OtpDelivery for TracingOtpDelivery {
    async fn send_code(&self, email: &str, _code: &str) -> Result<(), String> {
        tracing::info!(email, "email code issued (delivery delegated)");
        Ok(())
    }
}

/// Passkey ceremony verification collaborator: attestation/assertion
/// checking happens outside this engine.
#[async_trait::async_trait]
pub trait PasskeyVerifier: Send + Sync {
    /// Verify a ceremony response against the issued challenge nonce and
    /// return the authenticated user id.
    async fn verify(
        &self,
        challenge_nonce: &str,
        ceremony_response: &serde_json::Value,
    ) -> Result<String, String>;
}

/// DID proof-of-control verification collaborator.
#[async_trait::async_trait]
pub trait DidProofVerifier: Send + Sync {
    async fn verify(
        &self,
        did: &str,
        challenge_nonce: &str,
        proof: &serde_json::Value,
    ) -> Result<(), String>;
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GrantEngine>,
    pub logout: Arc<LogoutOrchestrator>,
    pub signer: Arc<TokenSigner>,
    pub keyring: Arc<KeyRing>,
    pub sessions: Arc<dyn SessionStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub anon_devices: Arc<dyn AnonymousDeviceStore>,
    pub linked_identities: Arc<dyn LinkedIdentityStore>,
    pub consents: Arc<dyn ConsentStore>,
    pub config: Arc<ConfigProvider>,
    pub rate_limits: Arc<RateLimiter>,
    pub events: Arc<dyn EventBus>,
    pub audit: Arc<dyn AuditLogger>,
    pub otp_delivery: Arc<dyn OtpDelivery>,
    pub passkeys: Arc<dyn PasskeyVerifier>,
    pub did_verifier: Arc<dyn DidProofVerifier>,
}

impl AppState {
    /// Resolve the tenant profile for a request. Single-tenant deployments
    /// resolve `default`; multi-tenant routing would key this off the
    /// host.
    pub async fn tenant(&self) -> Result<TenantProfile, error::ApiError> {
        TenantProfile::load(&self.config, "default")
            .await
            .map_err(|e| {
                error::ApiError::from(authrim_core::OAuthError::server_error(e.to_string()))
            })
    }
}
