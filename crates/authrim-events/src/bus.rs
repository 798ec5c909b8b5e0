//! Fire-and-forget domain-event publication.
//!
//! `publish` must never block the request path: the channel bus uses a
//! bounded queue with `try_send` and drops (counting) on overflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Known event families.
pub mod event_types {
    pub const AUTH_LOGIN_SUCCEEDED: &str = "auth.login.succeeded";
    pub const AUTH_LOGIN_FAILED: &str = "auth.login.failed";
    pub const AUTH_PASSKEY_SUCCEEDED: &str = "auth.passkey.succeeded";
    pub const AUTH_PASSKEY_FAILED: &str = "auth.passkey.failed";
    pub const AUTH_EMAIL_CODE_SUCCEEDED: &str = "auth.email_code.succeeded";

    pub const SESSION_USER_CREATED: &str = "session.user.created";
    pub const SESSION_USER_DESTROYED: &str = "session.user.destroyed";

    pub const USER_LOGOUT: &str = "user.logout";
    pub const USER_UPGRADED: &str = "user.upgraded";

    pub const TOKEN_ACCESS_ISSUED: &str = "token.access.issued";
    pub const TOKEN_REFRESH_ISSUED: &str = "token.refresh.issued";
    pub const TOKEN_REFRESH_ROTATED: &str = "token.refresh.rotated";
    pub const TOKEN_ID_ISSUED: &str = "token.id.issued";

    pub const CONSENT_GRANTED: &str = "consent.granted";
    pub const CONSENT_DENIED: &str = "consent.denied";
    pub const CONSENT_VERSION_UPGRADED: &str = "consent.version_upgraded";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: String,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl DomainEvent {
    pub fn new(event_type: &str, tenant_id: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            occurred_at: Utc::now(),
            data,
        }
    }
}

/// Non-blocking publisher. Implementations must return without awaiting any
/// downstream I/O.
pub trait EventBus: Send + Sync {
    fn publish(&self, event_type: &str, tenant_id: &str, data: serde_json::Value);
}

/// Logs events through `tracing`. Default sink for tests and single-node
/// deployments.
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn publish(&self, event_type: &str, tenant_id: &str, data: serde_json::Value) {
        info!(
            target: "events",
            event_type,
            tenant_id,
            data = %data,
            "DOMAIN_EVENT"
        );
    }
}

/// Bounded-channel bus; a [`EventWorker`] drains into the real transport.
pub struct ChannelEventBus {
    sender: mpsc::Sender<DomainEvent>,
    dropped: AtomicU64,
}

impl ChannelEventBus {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (
            Self {
                sender: tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus for ChannelEventBus {
    fn publish(&self, event_type: &str, tenant_id: &str, data: serde_json::Value) {
        let event = DomainEvent::new(event_type, tenant_id, data);
        if let Err(e) = self.sender.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                event_type,
                dropped_total = dropped,
                error = %e,
                "event queue full, dropping event"
            );
        }
    }
}

/// Drains the channel into a delegate sink.
pub struct EventWorker {
    receiver: mpsc::Receiver<DomainEvent>,
    delegate: Arc<dyn EventBus>,
}

impl EventWorker {
    pub fn new(receiver: mpsc::Receiver<DomainEvent>, delegate: Arc<dyn EventBus>) -> Self {
        Self { receiver, delegate }
    }

    pub async fn run(mut self) {
        info!("event worker started");
        while let Some(event) = self.receiver.recv().await {
            self.delegate
                .publish(&event.event_type, &event.tenant_id, event.data);
        }
        info!("event worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_does_not_block_when_full() {
        let (bus, _rx) = ChannelEventBus::new(1);
        bus.publish(event_types::TOKEN_ACCESS_ISSUED, "default", json!({"jti": "a"}));
        // Queue is full; this must return immediately and count the drop.
        bus.publish(event_types::TOKEN_ACCESS_ISSUED, "default", json!({"jti": "b"}));
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_to_delegate() {
        struct Counting(AtomicU64);
        impl EventBus for Counting {
            fn publish(&self, _: &str, _: &str, _: serde_json::Value) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (bus, rx) = ChannelEventBus::new(8);
        let delegate = Arc::new(Counting(AtomicU64::new(0)));
        let worker = EventWorker::new(rx, delegate.clone());

        bus.publish(event_types::SESSION_USER_CREATED, "default", json!({}));
        bus.publish(event_types::SESSION_USER_DESTROYED, "default", json!({}));
        drop(bus);

        worker.run().await;
        assert_eq!(delegate.0.load(Ordering::Relaxed), 2);
    }
}
