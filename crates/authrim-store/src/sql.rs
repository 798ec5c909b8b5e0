//! Relational mirrors and durable rows (MySQL).
//!
//! The sharded in-process stores are authoritative for the hot path; these
//! repositories hold the flat, queryable side: the user-keyed refresh-family
//! index, consent rows and linked identities.

use crate::consent::{ClientConsent, ConsentError, ConsentStore};
use crate::linked_identity::{LinkedIdentity, LinkedIdentityError, LinkedIdentityStore};
use crate::refresh_family::FamilyMirror;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool, Row};
use uuid::Uuid;

/// Flat `user_token_families` index for user-wide revocation lookups.
pub struct TokenFamilyRepository {
    pool: Pool<MySql>,
    tenant_id: String,
}

impl TokenFamilyRepository {
    pub fn new(pool: Pool<MySql>, tenant_id: impl Into<String>) -> Self {
        Self {
            pool,
            tenant_id: tenant_id.into(),
        }
    }

    pub async fn cleanup_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_token_families WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl FamilyMirror for TokenFamilyRepository {
    async fn record_head(
        &self,
        user_id: &str,
        client_id: &str,
        jti: &str,
        generation: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT INTO user_token_families (jti, tenant_id, user_id, client_id, generation, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE jti = VALUES(jti), expires_at = VALUES(expires_at)
            "#,
        )
        .bind(jti)
        .bind(&self.tenant_id)
        .bind(user_id)
        .bind(client_id)
        .bind(generation)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn list_user_heads(&self, user_id: &str) -> Result<Vec<(String, String)>, String> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, jti FROM user_token_families
            WHERE user_id = ? AND tenant_id = ? AND expires_at > ?
            "#,
        )
        .bind(user_id)
        .bind(&self.tenant_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("client_id").map_err(|e: sqlx::Error| e.to_string())?,
                    row.try_get("jti").map_err(|e: sqlx::Error| e.to_string())?,
                ))
            })
            .collect()
    }

    async fn remove_head(&self, jti: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM user_token_families WHERE jti = ?")
            .bind(jti)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

pub struct ConsentRepository {
    pool: Pool<MySql>,
}

impl ConsentRepository {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }

    fn row_to_consent(row: sqlx::mysql::MySqlRow) -> Result<ClientConsent, sqlx::Error> {
        Ok(ClientConsent {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            client_id: row.try_get("client_id")?,
            scope: row.try_get("scope")?,
            selected_scopes: row.try_get("selected_scopes")?,
            granted_at: row.try_get("granted_at")?,
            expires_at: row.try_get("expires_at")?,
            privacy_policy_version: row.try_get("privacy_policy_version")?,
            tos_version: row.try_get("tos_version")?,
            consent_version: row.try_get("consent_version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait::async_trait]
impl ConsentStore for ConsentRepository {
    async fn grant(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        selected_scopes: Option<&str>,
        privacy_policy_version: Option<&str>,
        tos_version: Option<&str>,
    ) -> Result<ClientConsent, ConsentError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO oauth_client_consents (
                id, user_id, client_id, scope, selected_scopes, granted_at,
                privacy_policy_version, tos_version, consent_version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON DUPLICATE KEY UPDATE
                scope = VALUES(scope),
                selected_scopes = VALUES(selected_scopes),
                granted_at = VALUES(granted_at),
                privacy_policy_version = VALUES(privacy_policy_version),
                tos_version = VALUES(tos_version),
                consent_version = consent_version + 1,
                updated_at = VALUES(updated_at)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(client_id)
        .bind(scope)
        .bind(selected_scopes)
        .bind(now)
        .bind(privacy_policy_version)
        .bind(tos_version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| ConsentError::StoreUnavailable(e.to_string()))?;

        self.find(user_id, client_id)
            .await?
            .ok_or_else(|| ConsentError::StoreUnavailable("consent row missing after upsert".into()))
    }

    async fn find(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientConsent>, ConsentError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, client_id, scope, selected_scopes, granted_at, expires_at,
                   privacy_policy_version, tos_version, consent_version, created_at, updated_at
            FROM oauth_client_consents
            WHERE user_id = ? AND client_id = ?
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConsentError::StoreUnavailable(e.to_string()))?;

        row.map(Self::row_to_consent)
            .transpose()
            .map_err(|e| ConsentError::StoreUnavailable(e.to_string()))
    }

    async fn revoke(&self, user_id: &str, client_id: &str) -> Result<bool, ConsentError> {
        let result =
            sqlx::query("DELETE FROM oauth_client_consents WHERE user_id = ? AND client_id = ?")
                .bind(user_id)
                .bind(client_id)
                .execute(&self.pool)
                .await
                .map_err(|e| ConsentError::StoreUnavailable(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct LinkedIdentityRepository {
    pool: Pool<MySql>,
}

impl LinkedIdentityRepository {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LinkedIdentityStore for LinkedIdentityRepository {
    async fn link(&self, identity: LinkedIdentity) -> Result<(), LinkedIdentityError> {
        let result = sqlx::query(
            r#"
            INSERT IGNORE INTO linked_identities
                (user_id, provider_id, provider_user_id, linked_at, raw_attributes)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identity.user_id)
        .bind(&identity.provider_id)
        .bind(&identity.provider_user_id)
        .bind(identity.linked_at)
        .bind(&identity.raw_attributes)
        .execute(&self.pool)
        .await
        .map_err(|e| LinkedIdentityError::StoreUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LinkedIdentityError::AlreadyLinked);
        }
        Ok(())
    }

    async fn find(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>, LinkedIdentityError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, provider_id, provider_user_id, linked_at, raw_attributes
            FROM linked_identities
            WHERE provider_id = ? AND provider_user_id = ?
            "#,
        )
        .bind(provider_id)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LinkedIdentityError::StoreUnavailable(e.to_string()))?;

        row.map(|row| {
            Ok(LinkedIdentity {
                user_id: row.try_get("user_id")?,
                provider_id: row.try_get("provider_id")?,
                provider_user_id: row.try_get("provider_user_id")?,
                linked_at: row.try_get("linked_at")?,
                raw_attributes: row.try_get("raw_attributes")?,
            })
        })
        .transpose()
        .map_err(|e: sqlx::Error| LinkedIdentityError::StoreUnavailable(e.to_string()))
    }

    async fn list_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<LinkedIdentity>, LinkedIdentityError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, provider_id, provider_user_id, linked_at, raw_attributes
            FROM linked_identities
            WHERE user_id = ?
            ORDER BY linked_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkedIdentityError::StoreUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(LinkedIdentity {
                    user_id: row.try_get("user_id")?,
                    provider_id: row.try_get("provider_id")?,
                    provider_user_id: row.try_get("provider_user_id")?,
                    linked_at: row.try_get("linked_at")?,
                    raw_attributes: row.try_get("raw_attributes")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| LinkedIdentityError::StoreUnavailable(e.to_string()))
    }

    async fn unlink(
        &self,
        user_id: &str,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<(), LinkedIdentityError> {
        let result = sqlx::query(
            r#"
            DELETE FROM linked_identities
            WHERE user_id = ? AND provider_id = ? AND provider_user_id = ?
            "#,
        )
        .bind(user_id)
        .bind(provider_id)
        .bind(provider_user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LinkedIdentityError::StoreUnavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LinkedIdentityError::NotFound);
        }
        Ok(())
    }
}
