//! Token-lifecycle and authorization state engine: grant execution, client
//! authentication, logout orchestration and the OAuth error taxonomy.

pub mod client_auth;
pub mod error;
pub mod grants;
pub mod logout;
pub mod models;
pub mod rate_limit;

pub use client_auth::{authenticate_client, AuthenticatedWith};
pub use error::OAuthError;
pub use grants::{GrantEngine, GrantEngineDeps};
pub use logout::{FrontChannelTarget, LogoutOrchestrator, LogoutOutcome};
pub use models::{
    grant_types, token_types, ClientAuthMethod, ClientMetadata, ClientRegistry, ClientType,
    InMemoryClientRegistry, TokenRequestContext, TokenResponse,
};
pub use rate_limit::{RateLimitRule, RateLimiter};
