//! Hashing utilities: PKCE, OIDC token hashes, JWK thumbprints, HMAC device
//! hashing and stored-secret (argon2) hashing.

use argon2::password_hash::{PasswordHasher as ArgonPasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use constant_time_eq::constant_time_eq;
use once_cell::sync::Lazy;
use rand::RngCore;
use rand_core::OsRng;
use regex::Regex;
use sha2::{Digest, Sha256};

/// RFC 7636 §4.1 code-verifier shape.
static CODE_VERIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-._~]{43,128}$").expect("static regex"));

/// base64url(SHA-256(input)), unpadded. The S256 PKCE transform.
pub fn s256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// PKCE check: verifier shape is enforced first, then the S256 transform is
/// compared against the stored challenge in constant time.
pub fn verify_pkce(code_verifier: &str, stored_challenge: &str) -> bool {
    if !CODE_VERIFIER_RE.is_match(code_verifier) {
        return false;
    }
    let computed = s256(code_verifier);
    constant_time_eq(computed.as_bytes(), stored_challenge.as_bytes())
}

/// Left half of SHA-256 over the token, base64url unpadded. Used for
/// `at_hash`, `c_hash` and `ds_hash`.
pub fn left_half_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// base64url(SHA-256(token)), unpadded. The DPoP `ath` binding.
pub fn access_token_hash(token: &str) -> String {
    s256(token)
}

/// Keyed device-identifier hash (HMAC-SHA256, base64url).
pub fn hmac_device_hash(key: &[u8], device_id: &str) -> String {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
    let tag = ring::hmac::sign(&key, device_id.as_bytes());
    URL_SAFE_NO_PAD.encode(tag.as_ref())
}

/// RFC 7638 JWK thumbprint: SHA-256 over the canonical JSON of the required
/// members in lexicographic order.
pub fn jwk_thumbprint(jwk: &serde_json::Value) -> Result<String, String> {
    let kty = jwk
        .get("kty")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "JWK missing 'kty'".to_string())?;

    let member = |name: &str| -> Result<&str, String> {
        jwk.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("JWK missing '{name}'"))
    };

    let canonical = match kty {
        "RSA" => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            member("e")?,
            member("n")?
        ),
        "EC" => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            member("crv")?,
            member("x")?,
            member("y")?
        ),
        other => return Err(format!("unsupported kty '{other}'")),
    };

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

/// Random URL-safe token of `bytes` entropy bytes.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Argon2 hashing for stored secrets (client secrets, device secrets).
#[derive(Debug, Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl SecretHasher {
    pub fn new() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }

    pub fn hash_secret(&self, secret: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| format!("secret hashing failed: {e}"))?
            .to_string())
    }

    pub fn verify_secret(&self, secret: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self::new()
    }
}
