//! Cryptographic core: signing keys, JWT minting and verification, DPoP
//! proof validation, PKCE and token-hash helpers.

pub mod dpop;
pub mod hashing;
pub mod jwe;
pub mod jwt;
pub mod keyring;

pub use dpop::{DpopError, DpopProof, DpopReplayStore, DpopValidator};
pub use hashing::{
    access_token_hash, hmac_device_hash, jwk_thumbprint, left_half_hash, random_token, s256,
    verify_pkce, SecretHasher,
};
pub use jwe::{encrypt_id_token, JweError};
pub use jwt::{
    AccessClaims, Actor, Audience, Confirmation, IdClaims, JwtError, LogoutClaims, RefreshClaims,
    TokenSigner, VerifyOptions,
};
pub use keyring::{KeyAlgorithm, KeyError, KeyRing, KeyStatus, KeyStore, SigningKey};
