//! Error taxonomy for the token-lifecycle engine.
//!
//! Collaborator refusals (consumed codes, theft detection) map to
//! `invalid_grant` with a generic description; transport failures map to
//! `server_error`. HTTP status codes are assigned at the API edge only.

use authrim_crypto::{DpopError, JwtError, KeyError};
use authrim_store::{ChallengeError, RefreshFamilyError, SessionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid_request: {description}")]
    InvalidRequest { description: String },

    #[error("invalid_client: {description}")]
    InvalidClient { description: String },

    #[error("invalid_grant: {description}")]
    InvalidGrant { description: String },

    #[error("unauthorized_client: {description}")]
    UnauthorizedClient { description: String },

    #[error("invalid_scope: {description}")]
    InvalidScope { description: String },

    #[error("invalid_target: {description}")]
    InvalidTarget { description: String },

    #[error("invalid_dpop_proof: {description}")]
    InvalidDpopProof { description: String },

    #[error("access_denied: {description}")]
    AccessDenied { description: String },

    #[error("slow_down")]
    SlowDown,

    #[error("authorization_pending")]
    AuthorizationPending,

    #[error("expired_token")]
    ExpiredToken,

    #[error("rate_limited")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("server_error")]
    ServerError { description: String },
}

impl OAuthError {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest {
            description: description.into(),
        }
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::InvalidClient {
            description: description.into(),
        }
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::InvalidGrant {
            description: description.into(),
        }
    }

    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self::UnauthorizedClient {
            description: description.into(),
        }
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::InvalidScope {
            description: description.into(),
        }
    }

    pub fn invalid_target(description: impl Into<String>) -> Self {
        Self::InvalidTarget {
            description: description.into(),
        }
    }

    pub fn access_denied(description: impl Into<String>) -> Self {
        Self::AccessDenied {
            description: description.into(),
        }
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::ServerError {
            description: description.into(),
        }
    }

    /// RFC 6749 / 8628 / 9449 error code for the wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest { .. } => "invalid_request",
            OAuthError::InvalidClient { .. } => "invalid_client",
            OAuthError::InvalidGrant { .. } => "invalid_grant",
            OAuthError::UnauthorizedClient { .. } => "unauthorized_client",
            OAuthError::InvalidScope { .. } => "invalid_scope",
            OAuthError::InvalidTarget { .. } => "invalid_target",
            OAuthError::InvalidDpopProof { .. } => "invalid_dpop_proof",
            OAuthError::AccessDenied { .. } => "access_denied",
            OAuthError::SlowDown => "slow_down",
            OAuthError::AuthorizationPending => "authorization_pending",
            OAuthError::ExpiredToken => "expired_token",
            OAuthError::RateLimited { .. } => "rate_limited",
            OAuthError::ServerError { .. } => "server_error",
        }
    }

    /// Wire description. Sensitive collaborator detail never leaks here.
    pub fn public_description(&self) -> String {
        match self {
            OAuthError::InvalidRequest { description }
            | OAuthError::InvalidClient { description }
            | OAuthError::UnauthorizedClient { description }
            | OAuthError::InvalidScope { description }
            | OAuthError::InvalidTarget { description }
            | OAuthError::InvalidDpopProof { description }
            | OAuthError::AccessDenied { description }
            | OAuthError::InvalidGrant { description } => description.clone(),
            OAuthError::SlowDown => "Polling too frequently".to_string(),
            OAuthError::AuthorizationPending => "Authorization request is pending".to_string(),
            OAuthError::ExpiredToken => "The authorization request has expired".to_string(),
            OAuthError::RateLimited { .. } => "Too many attempts".to_string(),
            OAuthError::ServerError { .. } => "Internal server error".to_string(),
        }
    }
}

impl From<ChallengeError> for OAuthError {
    fn from(err: ChallengeError) -> Self {
        match err {
            ChallengeError::NotFound | ChallengeError::Expired => {
                OAuthError::invalid_grant("Invalid or expired code")
            }
            ChallengeError::AlreadyConsumed { .. } => {
                OAuthError::invalid_grant("Invalid or expired code")
            }
            ChallengeError::PkceMismatch => OAuthError::invalid_grant("PKCE verification failed"),
            ChallengeError::ClientMismatch => OAuthError::invalid_grant("Invalid or expired code"),
            ChallengeError::PredicateMismatch { .. } => {
                OAuthError::invalid_grant("Verification failed")
            }
            ChallengeError::TooManyAttempts => OAuthError::RateLimited {
                retry_after_seconds: None,
            },
            ChallengeError::StoreUnavailable(detail) => OAuthError::server_error(detail),
        }
    }
}

impl From<RefreshFamilyError> for OAuthError {
    fn from(err: RefreshFamilyError) -> Self {
        match err {
            RefreshFamilyError::FamilyNotFound
            | RefreshFamilyError::MalformedJti
            | RefreshFamilyError::FamilyExists => {
                OAuthError::invalid_grant("Refresh token is not valid")
            }
            RefreshFamilyError::TheftDetected | RefreshFamilyError::FamilyRevoked { .. } => {
                OAuthError::invalid_grant("Refresh token has been revoked")
            }
            RefreshFamilyError::ScopeWidening => {
                OAuthError::invalid_scope("Requested scope exceeds granted scope")
            }
            RefreshFamilyError::StoreUnavailable(detail) => OAuthError::server_error(detail),
        }
    }
}

impl From<SessionError> for OAuthError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound | SessionError::LegacyId => {
                OAuthError::invalid_grant("Unknown session")
            }
            SessionError::StoreUnavailable(detail) => OAuthError::server_error(detail),
        }
    }
}

impl From<KeyError> for OAuthError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::UnknownKid => OAuthError::invalid_grant("Token signature is not valid"),
            other => OAuthError::server_error(other.to_string()),
        }
    }
}

impl From<JwtError> for OAuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::TokenExpired => OAuthError::invalid_grant("Token has expired"),
            JwtError::UnknownKey
            | JwtError::ValidationError { .. }
            | JwtError::InvalidFormat => OAuthError::invalid_grant("Token is not valid"),
            JwtError::EncodingError(_) | JwtError::KeyError(_) => {
                OAuthError::server_error("token signing failed")
            }
        }
    }
}

impl From<DpopError> for OAuthError {
    fn from(err: DpopError) -> Self {
        OAuthError::InvalidDpopProof {
            description: err.to_string(),
        }
    }
}
