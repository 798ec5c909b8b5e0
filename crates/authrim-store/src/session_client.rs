//! Session ↔ client associations: which relying parties obtained tokens
//! under a session and how to notify them at logout.
//!
//! Webhook secrets are held AEAD-encrypted; only the logout send worker
//! decrypts them.

use dashmap::DashMap;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionClientError {
    #[error("Session-client store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Webhook secret cipher failure")]
    CipherFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClient {
    pub session_id: String,
    pub client_id: String,
    pub backchannel_logout_uri: Option<String>,
    pub backchannel_logout_session_required: bool,
    pub frontchannel_logout_uri: Option<String>,
    pub frontchannel_logout_session_required: bool,
    pub webhook_url: Option<String>,
    /// `nonce || ciphertext || tag`; see [`encrypt_webhook_secret`].
    pub webhook_secret_enc: Option<Vec<u8>>,
}

pub fn encrypt_webhook_secret(key: &[u8; 32], secret: &str) -> Result<Vec<u8>, SessionClientError> {
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| SessionClientError::CipherFailure)?,
    );
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = secret.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| SessionClientError::CipherFailure)?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&in_out);
    Ok(out)
}

pub fn decrypt_webhook_secret(key: &[u8; 32], blob: &[u8]) -> Result<String, SessionClientError> {
    if blob.len() <= NONCE_LEN {
        return Err(SessionClientError::CipherFailure);
    }
    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| SessionClientError::CipherFailure)?,
    );
    let nonce_bytes: [u8; NONCE_LEN] = blob[..NONCE_LEN]
        .try_into()
        .map_err(|_| SessionClientError::CipherFailure)?;
    let mut in_out = blob[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| SessionClientError::CipherFailure)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| SessionClientError::CipherFailure)
}

#[async_trait::async_trait]
pub trait SessionClientIndex: Send + Sync {
    /// Upsert the association; first token issuance under a session
    /// registers the client's logout endpoints.
    async fn register(&self, row: SessionClient) -> Result<(), SessionClientError>;

    /// Snapshot all rows for a session. Logout collects this *before* any
    /// deletion cascade.
    async fn collect(&self, session_id: &str) -> Result<Vec<SessionClient>, SessionClientError>;

    /// Cascade on session invalidation.
    async fn remove_session(&self, session_id: &str) -> Result<usize, SessionClientError>;
}

pub struct InMemorySessionClientIndex {
    rows: DashMap<String, HashMap<String, SessionClient>>,
}

impl InMemorySessionClientIndex {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl Default for InMemorySessionClientIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionClientIndex for InMemorySessionClientIndex {
    async fn register(&self, row: SessionClient) -> Result<(), SessionClientError> {
        self.rows
            .entry(row.session_id.clone())
            .or_default()
            .insert(row.client_id.clone(), row);
        Ok(())
    }

    async fn collect(&self, session_id: &str) -> Result<Vec<SessionClient>, SessionClientError> {
        Ok(self
            .rows
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_session(&self, session_id: &str) -> Result<usize, SessionClientError> {
        Ok(self
            .rows
            .remove(session_id)
            .map(|(_, m)| m.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(session: &str, client: &str) -> SessionClient {
        SessionClient {
            session_id: session.to_string(),
            client_id: client.to_string(),
            backchannel_logout_uri: Some(format!("https://{client}.example/bc")),
            backchannel_logout_session_required: true,
            frontchannel_logout_uri: None,
            frontchannel_logout_session_required: false,
            webhook_url: None,
            webhook_secret_enc: None,
        }
    }

    #[tokio::test]
    async fn test_register_is_upsert() {
        let index = InMemorySessionClientIndex::new();
        index.register(row("sess_00_a", "rp1")).await.unwrap();
        index.register(row("sess_00_a", "rp1")).await.unwrap();
        index.register(row("sess_00_a", "rp2")).await.unwrap();

        let rows = index.collect("sess_00_a").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_cascade_removes_all_rows() {
        let index = InMemorySessionClientIndex::new();
        index.register(row("sess_00_a", "rp1")).await.unwrap();
        index.register(row("sess_00_a", "rp2")).await.unwrap();
        assert_eq!(index.remove_session("sess_00_a").await.unwrap(), 2);
        assert!(index.collect("sess_00_a").await.unwrap().is_empty());
    }

    #[test]
    fn test_webhook_secret_round_trip() {
        let key = [7u8; 32];
        let blob = encrypt_webhook_secret(&key, "whsec_123").unwrap();
        assert_eq!(decrypt_webhook_secret(&key, &blob).unwrap(), "whsec_123");

        let other_key = [9u8; 32];
        assert!(decrypt_webhook_secret(&other_key, &blob).is_err());
    }
}
