//! Per-tenant policy profile: which grants a tenant may use, TTL ceilings
//! and the Native SSO / token-exchange knobs.

use crate::keys;
use crate::provider::{ConfigError, ConfigProvider};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    RevokeOldest,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeSsoSettings {
    pub enabled: bool,
    pub device_secret_ttl_seconds: u64,
    pub per_user_cap: u64,
    pub overflow_policy: OverflowPolicy,
    pub max_use_count: u64,
    pub rate_limit_window_seconds: u64,
    pub rate_limit_max_attempts: u64,
    pub rate_limit_block_seconds: u64,
    pub allow_cross_client: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdJagSettings {
    pub enabled: bool,
    /// Empty list fails closed.
    pub allowed_issuers: Vec<String>,
    pub require_confidential_client: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenExchangeSettings {
    pub enabled: bool,
    pub allowed_subject_token_types: Vec<String>,
    pub max_resource_params: u64,
    pub max_audience_params: u64,
    pub id_jag: IdJagSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutSettings {
    pub backchannel_timeout_seconds: u64,
    pub backchannel_retries: u64,
}

/// Resolved tenant policy. All fields flow through the [`ConfigProvider`]
/// with `tenant.{id}.` overrides taking priority over the global keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub max_token_ttl_seconds: u64,
    pub allows_refresh_token: bool,
    pub allows_token_exchange: bool,
    pub allows_client_credentials: bool,
    pub allows_device_code: bool,
    pub allows_ciba: bool,
    pub allows_jwt_bearer: bool,
    pub fapi_enabled: bool,
    pub require_dpop: bool,
    pub refresh_rotation_enabled: bool,
    pub native_sso: NativeSsoSettings,
    pub token_exchange: TokenExchangeSettings,
    pub client_credentials_enabled: bool,
    pub logout: LogoutSettings,
    pub allowed_origins: Vec<String>,
}

impl TenantProfile {
    pub async fn load(provider: &ConfigProvider, tenant_id: &str) -> Result<Self, ConfigError> {
        let get_bool = |key: &'static str, fallback: bool| async move {
            match provider.get(&format!("tenant.{tenant_id}.{key}")).await {
                Some(serde_json::Value::Bool(b)) => b,
                _ => provider.get_bool(key, fallback).await,
            }
        };
        let get_u64 = |key: &'static str, fallback: u64| async move {
            match provider.get(&format!("tenant.{tenant_id}.{key}")).await {
                Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(fallback),
                _ => provider.get_u64(key, fallback).await,
            }
        };

        let refresh_rotation_enabled = get_bool(keys::REFRESH_ROTATION_ENABLED, true).await;
        // Disabling rotation exists for test rigs only; a release build
        // refuses to load such a profile.
        if !refresh_rotation_enabled && !cfg!(debug_assertions) {
            return Err(ConfigError::InvalidValue {
                key: keys::REFRESH_ROTATION_ENABLED.to_string(),
                reason: "refresh-token rotation cannot be disabled in release builds".to_string(),
            });
        }

        let overflow_policy = match provider
            .get_string(keys::NATIVE_SSO_OVERFLOW_POLICY)
            .await
            .as_deref()
        {
            Some("reject") => OverflowPolicy::Reject,
            _ => OverflowPolicy::RevokeOldest,
        };

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            max_token_ttl_seconds: get_u64(keys::TENANT_MAX_TOKEN_TTL, 3600).await,
            allows_refresh_token: get_bool(keys::TENANT_ALLOWS_REFRESH, true).await,
            allows_token_exchange: get_bool(keys::TENANT_ALLOWS_TOKEN_EXCHANGE, true).await,
            allows_client_credentials: get_bool(keys::TENANT_ALLOWS_CLIENT_CREDENTIALS, true).await,
            allows_device_code: get_bool(keys::TENANT_ALLOWS_DEVICE_CODE, true).await,
            allows_ciba: get_bool(keys::TENANT_ALLOWS_CIBA, false).await,
            allows_jwt_bearer: get_bool(keys::TENANT_ALLOWS_JWT_BEARER, false).await,
            fapi_enabled: get_bool(keys::FAPI_ENABLED, false).await,
            require_dpop: get_bool(keys::FAPI_REQUIRE_DPOP, false).await,
            refresh_rotation_enabled,
            native_sso: NativeSsoSettings {
                enabled: get_bool(keys::NATIVE_SSO_ENABLED, false).await,
                device_secret_ttl_seconds: get_u64(keys::NATIVE_SSO_DEVICE_SECRET_TTL, 7_776_000)
                    .await,
                per_user_cap: get_u64(keys::NATIVE_SSO_PER_USER_CAP, 10).await,
                overflow_policy,
                max_use_count: get_u64(keys::NATIVE_SSO_MAX_USE_COUNT, 1000).await,
                rate_limit_window_seconds: get_u64(keys::NATIVE_SSO_RATE_WINDOW, 60).await,
                rate_limit_max_attempts: get_u64(keys::NATIVE_SSO_RATE_MAX, 10).await,
                rate_limit_block_seconds: get_u64(keys::NATIVE_SSO_RATE_BLOCK, 300).await,
                allow_cross_client: get_bool(keys::NATIVE_SSO_ALLOW_CROSS_CLIENT, false).await,
            },
            token_exchange: TokenExchangeSettings {
                enabled: get_bool(keys::TOKEN_EXCHANGE_ENABLED, false).await,
                allowed_subject_token_types: provider
                    .get_string_list(keys::TOKEN_EXCHANGE_SUBJECT_TYPES)
                    .await,
                max_resource_params: get_u64(keys::TOKEN_EXCHANGE_MAX_RESOURCES, 10).await,
                max_audience_params: get_u64(keys::TOKEN_EXCHANGE_MAX_AUDIENCES, 10).await,
                id_jag: IdJagSettings {
                    enabled: get_bool(keys::ID_JAG_ENABLED, false).await,
                    allowed_issuers: provider.get_string_list(keys::ID_JAG_ALLOWED_ISSUERS).await,
                    require_confidential_client: get_bool(keys::ID_JAG_REQUIRE_CONFIDENTIAL, true)
                        .await,
                },
            },
            client_credentials_enabled: get_bool(keys::CLIENT_CREDENTIALS_ENABLED, true).await,
            logout: LogoutSettings {
                backchannel_timeout_seconds: get_u64(keys::LOGOUT_BACKCHANNEL_TIMEOUT, 5).await,
                backchannel_retries: get_u64(keys::LOGOUT_BACKCHANNEL_RETRIES, 2).await,
            },
            allowed_origins: provider.get_string_list(keys::ALLOWED_ORIGINS).await,
        })
    }

    /// Whether the tenant permits a `grant_type` value at the token
    /// endpoint. `authorization_code` is always permitted.
    pub fn allows_grant(&self, grant_type: &str) -> bool {
        match grant_type {
            "authorization_code" => true,
            "refresh_token" => self.allows_refresh_token,
            "client_credentials" => {
                self.allows_client_credentials && self.client_credentials_enabled
            }
            "urn:ietf:params:oauth:grant-type:device_code" => self.allows_device_code,
            "urn:openid:params:grant-type:ciba" => self.allows_ciba,
            "urn:ietf:params:oauth:grant-type:jwt-bearer" => self.allows_jwt_bearer,
            "urn:ietf:params:oauth:grant-type:token-exchange" => {
                self.allows_token_exchange && self.token_exchange.enabled
            }
            _ => false,
        }
    }

    pub fn cap_ttl(&self, configured_ttl: u64) -> u64 {
        configured_ttl.min(self.max_token_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{KvStore, MemoryKvStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_profile_defaults() {
        let provider = ConfigProvider::defaults_only();
        let profile = TenantProfile::load(&provider, "default").await.unwrap();
        assert_eq!(profile.max_token_ttl_seconds, 3600);
        assert!(profile.allows_grant("authorization_code"));
        assert!(profile.allows_grant("refresh_token"));
        assert!(!profile.allows_grant("urn:ietf:params:oauth:grant-type:token-exchange"));
        assert!(!profile.allows_grant("implicit"));
    }

    #[tokio::test]
    async fn test_tenant_override_wins() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put("tenant.acme.tenant.max_token_ttl_seconds", "600", None)
            .await
            .unwrap();
        let provider = ConfigProvider::new(kv);
        let profile = TenantProfile::load(&provider, "acme").await.unwrap();
        assert_eq!(profile.max_token_ttl_seconds, 600);
        assert_eq!(profile.cap_ttl(900), 600);
        assert_eq!(profile.cap_ttl(300), 300);
    }

    #[tokio::test]
    async fn test_token_exchange_gated_on_feature_flag() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(keys::TOKEN_EXCHANGE_ENABLED, "true", None).await.unwrap();
        let provider = ConfigProvider::new(kv);
        let profile = TenantProfile::load(&provider, "default").await.unwrap();
        assert!(profile.allows_grant("urn:ietf:params:oauth:grant-type:token-exchange"));
    }
}
