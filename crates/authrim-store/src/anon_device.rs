//! Anonymous device records: at most one active row per
//! (tenant, device-id hash).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AnonDeviceError {
    #[error("Anonymous device store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStability {
    Session,
    Installation,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousDevice {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub device_id_hash: String,
    pub device_stability: DeviceStability,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait AnonymousDeviceStore: Send + Sync {
    /// Activate a device record, deactivating any existing active row for
    /// the same (tenant, device hash).
    async fn upsert_active(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id_hash: &str,
        stability: DeviceStability,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AnonymousDevice, AnonDeviceError>;

    async fn get_active(
        &self,
        tenant_id: &str,
        device_id_hash: &str,
    ) -> Result<Option<AnonymousDevice>, AnonDeviceError>;

    async fn deactivate(
        &self,
        tenant_id: &str,
        device_id_hash: &str,
    ) -> Result<bool, AnonDeviceError>;
}

pub struct InMemoryAnonymousDeviceStore {
    // (tenant, device hash) -> active record; history is not retained.
    devices: DashMap<(String, String), AnonymousDevice>,
}

impl InMemoryAnonymousDeviceStore {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
        }
    }
}

impl Default for InMemoryAnonymousDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AnonymousDeviceStore for InMemoryAnonymousDeviceStore {
    async fn upsert_active(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id_hash: &str,
        stability: DeviceStability,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AnonymousDevice, AnonDeviceError> {
        let record = AnonymousDevice {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            device_id_hash: device_id_hash.to_string(),
            device_stability: stability,
            expires_at,
            is_active: true,
            created_at: Utc::now(),
        };
        self.devices.insert(
            (tenant_id.to_string(), device_id_hash.to_string()),
            record.clone(),
        );
        Ok(record)
    }

    async fn get_active(
        &self,
        tenant_id: &str,
        device_id_hash: &str,
    ) -> Result<Option<AnonymousDevice>, AnonDeviceError> {
        let key = (tenant_id.to_string(), device_id_hash.to_string());
        Ok(self.devices.get(&key).filter(|d| d.is_active).and_then(|d| {
            match d.expires_at {
                Some(exp) if exp <= Utc::now() => None,
                _ => Some(d.clone()),
            }
        }))
    }

    async fn deactivate(
        &self,
        tenant_id: &str,
        device_id_hash: &str,
    ) -> Result<bool, AnonDeviceError> {
        let key = (tenant_id.to_string(), device_id_hash.to_string());
        match self.devices.get_mut(&key) {
            Some(mut d) if d.is_active => {
                d.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_active_record_per_device() {
        let store = InMemoryAnonymousDeviceStore::new();
        let first = store
            .upsert_active("default", "anon-1", "hash-a", DeviceStability::Device, None)
            .await
            .unwrap();
        let second = store
            .upsert_active("default", "anon-2", "hash-a", DeviceStability::Device, None)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let active = store.get_active("default", "hash-a").await.unwrap().unwrap();
        assert_eq!(active.user_id, "anon-2");
    }

    #[tokio::test]
    async fn test_deactivate() {
        let store = InMemoryAnonymousDeviceStore::new();
        store
            .upsert_active("default", "anon-1", "hash-a", DeviceStability::Installation, None)
            .await
            .unwrap();
        assert!(store.deactivate("default", "hash-a").await.unwrap());
        assert!(store.get_active("default", "hash-a").await.unwrap().is_none());
        assert!(!store.deactivate("default", "hash-a").await.unwrap());
    }
}
