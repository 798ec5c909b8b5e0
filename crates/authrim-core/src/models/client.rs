//! Relying-party metadata and the client registry collaborator.

use authrim_crypto::SecretHasher;
use constant_time_eq::constant_time_eq;
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
    None,
}

#[derive(Clone)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_name: Option<String>,
    pub client_type: ClientType,
    pub token_endpoint_auth_method: ClientAuthMethod,
    /// Argon2 hash of the client secret (Basic / form verification).
    pub secret_hash: Option<String>,
    /// Raw secret, held only for clients that use `client_secret_jwt` or
    /// symmetric ID-token encryption.
    pub client_secret: Option<Secret<String>>,
    /// Public JWKS for `private_key_jwt` clients.
    pub jwks: Option<serde_json::Value>,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub allowed_token_exchange_resources: Vec<String>,
    /// Clients whose tokens this client may present as subject tokens.
    pub allowed_subject_token_clients: Vec<String>,
    pub require_dpop: bool,
    pub native_sso_enabled: bool,
    pub allow_cross_client_native_sso: bool,
    pub id_token_encrypted_response_alg: Option<String>,
    pub id_token_encrypted_response_enc: Option<String>,
    pub backchannel_logout_uri: Option<String>,
    pub backchannel_logout_session_required: bool,
    pub frontchannel_logout_uri: Option<String>,
    pub frontchannel_logout_session_required: bool,
    pub post_logout_redirect_uris: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<Secret<String>>,
}

impl ClientMetadata {
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_name: None,
            client_type: ClientType::Public,
            token_endpoint_auth_method: ClientAuthMethod::None,
            secret_hash: None,
            client_secret: None,
            jwks: None,
            redirect_uris: Vec::new(),
            allowed_scopes: Vec::new(),
            allowed_token_exchange_resources: Vec::new(),
            allowed_subject_token_clients: Vec::new(),
            require_dpop: false,
            native_sso_enabled: false,
            allow_cross_client_native_sso: false,
            id_token_encrypted_response_alg: None,
            id_token_encrypted_response_enc: None,
            backchannel_logout_uri: None,
            backchannel_logout_session_required: false,
            frontchannel_logout_uri: None,
            frontchannel_logout_session_required: false,
            post_logout_redirect_uris: Vec::new(),
            webhook_url: None,
            webhook_secret: None,
        }
    }

    pub fn confidential(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let secret_hash = SecretHasher::new().hash_secret(&secret).ok();
        Self {
            client_type: ClientType::Confidential,
            token_endpoint_auth_method: ClientAuthMethod::ClientSecretBasic,
            secret_hash,
            client_secret: Some(Secret::new(secret)),
            ..Self::public(client_id)
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }

    /// Verify a presented secret against the argon2 hash, falling back to a
    /// constant-time comparison for registrations that only carry the raw
    /// secret.
    pub fn verify_secret(&self, presented: &str) -> bool {
        if let Some(hash) = &self.secret_hash {
            return SecretHasher::new().verify_secret(presented, hash);
        }
        if let Some(secret) = &self.client_secret {
            return constant_time_eq(secret.expose_secret().as_bytes(), presented.as_bytes());
        }
        false
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.allowed_scopes.is_empty() || self.allowed_scopes.iter().any(|s| s == scope)
    }

    /// Intersect a requested scope string with the client's allowed set.
    pub fn intersect_scopes(&self, requested: &str) -> String {
        requested
            .split_whitespace()
            .filter(|s| self.allows_scope(s))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn wants_encrypted_id_token(&self) -> bool {
        self.id_token_encrypted_response_alg.is_some()
    }
}

/// Ordered client lookup (collaborator; durable registration store in
/// production).
#[async_trait::async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn get(&self, client_id: &str) -> Option<ClientMetadata>;
}

pub struct InMemoryClientRegistry {
    clients: DashMap<String, ClientMetadata>,
}

impl InMemoryClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn insert(&self, client: ClientMetadata) {
        self.clients.insert(client.client_id.clone(), client);
    }
}

impl Default for InMemoryClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn get(&self, client_id: &str) -> Option<ClientMetadata> {
        self.clients.get(client_id).map(|c| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_verification_paths() {
        let client = ClientMetadata::confidential("c1", "top-secret");
        assert!(client.verify_secret("top-secret"));
        assert!(!client.verify_secret("wrong"));

        let mut raw_only = ClientMetadata::public("c2");
        raw_only.client_secret = Some(Secret::new("raw".to_string()));
        assert!(raw_only.verify_secret("raw"));
        assert!(!raw_only.verify_secret("other"));

        assert!(!ClientMetadata::public("c3").verify_secret("anything"));
    }

    #[test]
    fn test_scope_intersection() {
        let mut client = ClientMetadata::public("c1");
        client.allowed_scopes = vec!["openid".into(), "profile".into()];
        assert_eq!(client.intersect_scopes("openid profile email"), "openid profile");

        // An empty allow-list means no restriction.
        let open = ClientMetadata::public("c2");
        assert_eq!(open.intersect_scopes("openid email"), "openid email");
    }
}
