//! Token endpoint request and response shapes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Narrow request view handed to the grant engine: everything it needs,
/// nothing framework-specific.
#[derive(Debug, Clone, Default)]
pub struct TokenRequestContext {
    pub method: String,
    pub uri: String,
    pub authorization_header: Option<String>,
    pub dpop_proof: Option<String>,
    pub client_ip: Option<String>,
    pub form: HashMap<String, String>,
}

impl TokenRequestContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    pub fn require_param(&self, name: &str) -> Result<&str, crate::error::OAuthError> {
        self.param(name).filter(|v| !v.is_empty()).ok_or_else(|| {
            crate::error::OAuthError::invalid_request(format!("Missing parameter: {name}"))
        })
    }

    /// Multi-valued form parameter (`resource`, `audience`): the form layer
    /// joins repeats with `\n`.
    pub fn params_multi(&self, name: &str) -> Vec<String> {
        self.param(name)
            .map(|v| {
                v.split('\n')
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_secret: Option<String>,
}

impl TokenResponse {
    pub fn bearer(access_token: String, expires_in: u64) -> Self {
        Self {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_token: None,
            id_token: None,
            scope: None,
            issued_token_type: None,
            device_secret: None,
        }
    }

    pub fn sender_constrained(access_token: String, expires_in: u64) -> Self {
        Self {
            token_type: "DPoP".to_string(),
            ..Self::bearer(access_token, expires_in)
        }
    }
}

/// RFC 8693 token type URNs plus the extensions this engine understands.
pub mod token_types {
    pub const ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
    pub const ID_TOKEN: &str = "urn:ietf:params:oauth:token-type:id_token";
    pub const JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
    pub const SAML2: &str = "urn:ietf:params:oauth:token-type:saml2";
    pub const REFRESH_TOKEN: &str = "urn:ietf:params:oauth:token-type:refresh_token";
    pub const DEVICE_SECRET: &str = "urn:openid:params:token-type:device-secret";
    pub const ID_JAG: &str = "urn:ietf:params:oauth:token-type:id-jag";
}

pub mod grant_types {
    pub const AUTHORIZATION_CODE: &str = "authorization_code";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const CLIENT_CREDENTIALS: &str = "client_credentials";
    pub const DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
    pub const CIBA: &str = "urn:openid:params:grant-type:ciba";
    pub const JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
    pub const TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
}
