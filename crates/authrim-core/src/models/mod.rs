pub mod client;
pub mod token;

pub use client::{
    ClientAuthMethod, ClientMetadata, ClientRegistry, ClientType, InMemoryClientRegistry,
};
pub use token::{grant_types, token_types, TokenRequestContext, TokenResponse};
