//! Nested JWE for encrypted ID tokens (`alg=dir`, `enc=A256GCM`).
//!
//! The content-encryption key is derived from the client secret with
//! HKDF-SHA256, so confidential clients can unwrap without extra key
//! distribution. The payload is the already-signed ID-token JWS
//! (`cty: "JWT"`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use thiserror::Error;

const HKDF_INFO: &[u8] = b"authrim/id-token-jwe";

#[derive(Debug, Error)]
pub enum JweError {
    #[error("Unsupported JWE algorithm: {alg}/{enc}")]
    UnsupportedAlgorithm { alg: String, enc: String },
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Malformed JWE")]
    Malformed,
}

struct OkmLen(usize);

impl ring::hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn derive_cek(client_id: &str, client_secret: &str) -> Result<[u8; 32], JweError> {
    let salt = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, client_id.as_bytes());
    let prk = salt.extract(client_secret.as_bytes());
    let okm = prk
        .expand(&[HKDF_INFO], OkmLen(32))
        .map_err(|_| JweError::KeyDerivation)?;
    let mut cek = [0u8; 32];
    okm.fill(&mut cek).map_err(|_| JweError::KeyDerivation)?;
    Ok(cek)
}

/// Wrap a signed ID-token JWS as a compact JWE for `client_id`.
pub fn encrypt_id_token(
    signed_jwt: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String, JweError> {
    let cek = derive_cek(client_id, client_secret)?;
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, &cek).map_err(|_| JweError::EncryptionFailed)?,
    );

    let header = serde_json::json!({ "alg": "dir", "enc": "A256GCM", "cty": "JWT" });
    let protected = URL_SAFE_NO_PAD.encode(header.to_string());

    let mut iv = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::assume_unique_for_key(iv);

    let mut in_out = signed_jwt.as_bytes().to_vec();
    let tag = key
        .seal_in_place_separate_tag(nonce, Aad::from(protected.as_bytes()), &mut in_out)
        .map_err(|_| JweError::EncryptionFailed)?;

    Ok(format!(
        "{}..{}.{}.{}",
        protected,
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(&in_out),
        URL_SAFE_NO_PAD.encode(tag.as_ref()),
    ))
}

/// Unwrap a compact JWE produced by [`encrypt_id_token`]. Exercised by
/// relying-party-side tests.
pub fn decrypt_id_token(
    jwe: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String, JweError> {
    let parts: Vec<&str> = jwe.split('.').collect();
    if parts.len() != 5 || !parts[1].is_empty() {
        return Err(JweError::Malformed);
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|_| JweError::Malformed)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| JweError::Malformed)?;
    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    let enc = header.get("enc").and_then(|v| v.as_str()).unwrap_or("");
    if alg != "dir" || enc != "A256GCM" {
        return Err(JweError::UnsupportedAlgorithm {
            alg: alg.to_string(),
            enc: enc.to_string(),
        });
    }

    let iv_bytes = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| JweError::Malformed)?;
    let iv: [u8; NONCE_LEN] = iv_bytes.try_into().map_err(|_| JweError::Malformed)?;
    let mut ciphertext = URL_SAFE_NO_PAD
        .decode(parts[3])
        .map_err(|_| JweError::Malformed)?;
    let tag = URL_SAFE_NO_PAD
        .decode(parts[4])
        .map_err(|_| JweError::Malformed)?;
    ciphertext.extend_from_slice(&tag);

    let cek = derive_cek(client_id, client_secret)?;
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, &cek).map_err(|_| JweError::DecryptionFailed)?,
    );
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(iv),
            Aad::from(parts[0].as_bytes()),
            &mut ciphertext,
        )
        .map_err(|_| JweError::DecryptionFailed)?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| JweError::Malformed)
}
