//! Grant dispatch and the shared token-minting plumbing.
//!
//! Every grant runs the same shape: validate the request, authenticate the
//! client, execute against the stores, mint through the key ring, emit
//! events after the authoritative state change.

pub mod authorization_code;
pub mod ciba;
pub mod client_credentials;
pub mod device_code;
pub mod id_jag;
pub mod jwt_bearer;
pub mod native_sso;
pub mod refresh;
pub mod token_exchange;

use crate::error::OAuthError;
use crate::models::{grant_types, ClientMetadata, ClientRegistry, TokenRequestContext, TokenResponse};
use crate::rate_limit::RateLimiter;
use authrim_config::{ConfigProvider, TenantProfile};
use authrim_crypto::jwt::{AccessClaims, Audience, IdClaims, RefreshClaims};
use authrim_crypto::{left_half_hash, DpopValidator, TokenSigner};
use authrim_events::{AuditLogger, EventBus, WaitUntil};
use authrim_store::{
    new_access_jti, ChallengeStore, DeviceSecretStore, JtiReplayIndex, RefreshFamilyManager,
    SessionClientIndex, SessionStore, TokenRevocationIndex,
};
use chrono::Utc;
use jwt_bearer::TrustedIssuerTable;
use std::sync::Arc;

pub struct GrantEngineDeps {
    pub signer: Arc<TokenSigner>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub session_clients: Arc<dyn SessionClientIndex>,
    pub families: Arc<RefreshFamilyManager>,
    pub revocations: Arc<dyn TokenRevocationIndex>,
    pub device_secrets: Arc<dyn DeviceSecretStore>,
    pub dpop: Arc<DpopValidator>,
    pub clients: Arc<dyn ClientRegistry>,
    pub config: Arc<ConfigProvider>,
    pub events: Arc<dyn EventBus>,
    pub audit: Arc<dyn AuditLogger>,
    pub wait_until: WaitUntil,
    pub sso_replay: Arc<JtiReplayIndex>,
    pub rate_limits: Arc<RateLimiter>,
    pub trusted_issuers: Arc<TrustedIssuerTable>,
    pub revocation_shards: u32,
}

pub struct GrantEngine {
    pub(crate) deps: GrantEngineDeps,
}

impl GrantEngine {
    pub fn new(deps: GrantEngineDeps) -> Self {
        Self { deps }
    }

    pub fn signer(&self) -> &Arc<TokenSigner> {
        &self.deps.signer
    }

    pub fn issuer(&self) -> &str {
        self.deps.signer.issuer()
    }

    pub fn challenges(&self) -> &Arc<dyn ChallengeStore> {
        &self.deps.challenges
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.deps.sessions
    }

    pub fn clients(&self) -> &Arc<dyn ClientRegistry> {
        &self.deps.clients
    }

    pub fn config(&self) -> &Arc<ConfigProvider> {
        &self.deps.config
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.deps.events
    }

    pub fn rate_limits(&self) -> &Arc<RateLimiter> {
        &self.deps.rate_limits
    }

    pub fn revocations(&self) -> &Arc<dyn TokenRevocationIndex> {
        &self.deps.revocations
    }

    pub fn families(&self) -> &Arc<RefreshFamilyManager> {
        &self.deps.families
    }

    pub fn device_secrets(&self) -> &Arc<dyn DeviceSecretStore> {
        &self.deps.device_secrets
    }

    pub fn session_clients(&self) -> &Arc<dyn SessionClientIndex> {
        &self.deps.session_clients
    }

    /// Token endpoint entry: dispatch on `grant_type` after the tenant
    /// profile gate.
    pub async fn handle_token(
        &self,
        ctx: &TokenRequestContext,
        tenant: &TenantProfile,
    ) -> Result<TokenResponse, OAuthError> {
        let grant_type = ctx.require_param("grant_type")?;
        if !tenant.allows_grant(grant_type) {
            return Err(OAuthError::unauthorized_client(
                "Grant type not allowed for this tenant",
            ));
        }

        match grant_type {
            grant_types::AUTHORIZATION_CODE => {
                authorization_code::execute(self, ctx, tenant).await
            }
            grant_types::REFRESH_TOKEN => refresh::execute(self, ctx, tenant).await,
            grant_types::DEVICE_CODE => device_code::execute(self, ctx, tenant).await,
            grant_types::CIBA => ciba::execute(self, ctx, tenant).await,
            grant_types::JWT_BEARER => jwt_bearer::execute(self, ctx, tenant).await,
            grant_types::TOKEN_EXCHANGE => token_exchange::execute(self, ctx, tenant).await,
            grant_types::CLIENT_CREDENTIALS => {
                client_credentials::execute(self, ctx, tenant).await
            }
            _ => Err(OAuthError::invalid_request("Unsupported grant_type")),
        }
    }

    /// Effective access-token lifetime: configured TTL capped by the
    /// tenant profile.
    pub(crate) async fn access_ttl(&self, tenant: &TenantProfile) -> u64 {
        let configured = self
            .deps
            .config
            .get_u64(authrim_config::keys::TOKEN_ACCESS_TTL, 900)
            .await;
        tenant.cap_ttl(configured)
    }

    pub(crate) async fn refresh_ttl(&self) -> u64 {
        self.deps
            .config
            .get_u64(authrim_config::keys::TOKEN_REFRESH_TTL, 2_592_000)
            .await
    }

    /// Skeleton access claims: issuer audience, region-sharded jti, clock
    /// fields. Grants fill in the subject-specific parts.
    pub(crate) fn base_access_claims(
        &self,
        sub: &str,
        client_id: &str,
        scope: &str,
        expires_in: u64,
    ) -> AccessClaims {
        let now = Utc::now().timestamp();
        AccessClaims {
            iss: self.issuer().to_string(),
            sub: sub.to_string(),
            aud: Audience::Single(self.issuer().to_string()),
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            jti: new_access_jti(self.deps.revocation_shards),
            iat: now,
            exp: now + expires_in as i64,
            cnf: None,
            authorization_details: None,
            act: None,
            acr: None,
            amr: None,
            roles: None,
            permissions: None,
            anonymous: None,
            original_issuer: None,
            tenant: None,
        }
    }

    pub(crate) fn base_id_claims(
        &self,
        sub: &str,
        client_id: &str,
        auth_time: i64,
        expires_in: u64,
    ) -> IdClaims {
        let now = Utc::now().timestamp();
        IdClaims {
            iss: self.issuer().to_string(),
            sub: sub.to_string(),
            aud: client_id.to_string(),
            iat: now,
            exp: now + expires_in as i64,
            auth_time,
            nonce: None,
            at_hash: None,
            c_hash: None,
            ds_hash: None,
            sid: None,
            acr: None,
            amr: None,
            roles: None,
        }
    }

    /// Sign an ID token, wrapping it as a nested JWE when the client
    /// declares symmetric encryption.
    pub(crate) async fn sign_id_token(
        &self,
        claims: &IdClaims,
        client: &ClientMetadata,
    ) -> Result<String, OAuthError> {
        let signed = self.deps.signer.sign_id(claims).await?;
        if !client.wants_encrypted_id_token() {
            return Ok(signed);
        }
        match (
            client.id_token_encrypted_response_alg.as_deref(),
            client.id_token_encrypted_response_enc.as_deref(),
            client.client_secret.as_ref(),
        ) {
            (Some("dir"), Some("A256GCM") | None, Some(secret)) => {
                use secrecy::ExposeSecret;
                authrim_crypto::encrypt_id_token(&signed, &client.client_id, secret.expose_secret())
                    .map_err(|e| OAuthError::server_error(e.to_string()))
            }
            _ => Err(OAuthError::server_error(
                "unsupported id_token encryption registration",
            )),
        }
    }

    /// Mint a fresh refresh token bound to a (new or rotated) family head.
    pub(crate) async fn sign_refresh_token(
        &self,
        sub: &str,
        client_id: &str,
        scope: &str,
        jti: &str,
        rtv: u32,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<String, OAuthError> {
        let now = Utc::now().timestamp();
        let claims = RefreshClaims {
            iss: self.issuer().to_string(),
            sub: sub.to_string(),
            aud: client_id.to_string(),
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            jti: jti.to_string(),
            iat: now,
            exp: expires_at.timestamp(),
            rtv,
        };
        Ok(self.deps.signer.sign_refresh(&claims).await?)
    }

    /// Pre-validate a DPoP proof on the token endpoint, yielding the key
    /// thumbprint for `cnf` binding.
    pub(crate) async fn validate_dpop(
        &self,
        ctx: &TokenRequestContext,
        client_id: &str,
    ) -> Result<Option<String>, OAuthError> {
        match &ctx.dpop_proof {
            Some(proof) => {
                let result = self
                    .deps
                    .dpop
                    .validate(proof, &ctx.method, &ctx.uri, None, client_id)
                    .await?;
                Ok(Some(result.jkt))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn emit(&self, event_type: &str, tenant: &TenantProfile, data: serde_json::Value) {
        self.deps.events.publish(event_type, &tenant.tenant_id, data);
    }

    /// at_hash / c_hash / ds_hash helper re-exported for grant modules.
    pub(crate) fn half_hash(value: &str) -> String {
        left_half_hash(value)
    }
}
