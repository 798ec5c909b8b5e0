//! Audit records for security-relevant transitions.
//!
//! Audit writes happen after the authoritative state change and are
//! best-effort: a failing sink never rolls back user-visible success.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub metadata: serde_json::Value,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            tenant_id: tenant_id.into(),
            actor_id: None,
            resource_id: None,
            ip_address: None,
            metadata: serde_json::json!({}),
            outcome: AuditOutcome::Success,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn failure(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure {
            reason: reason.into(),
        };
        self
    }
}

#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(&self, event: AuditEvent);
}

/// Structured output through `tracing` with a dedicated target so audit
/// records can be routed separately.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_id = %event.id,
            action = %event.action,
            tenant_id = %event.tenant_id,
            actor_id = ?event.actor_id,
            resource_id = ?event.resource_id,
            outcome = ?event.outcome,
            payload = %serde_json::to_string(&event).unwrap_or_default(),
            "AUDIT_EVENT"
        );
    }
}

/// Channel-backed logger that offloads writes to a background worker. A
/// bounded channel provides backpressure without stalling the auth flow.
pub struct AsyncAuditLogger {
    sender: mpsc::Sender<AuditEvent>,
}

impl AsyncAuditLogger {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (Self { sender: tx }, rx)
    }
}

#[async_trait::async_trait]
impl AuditLogger for AsyncAuditLogger {
    async fn log(&self, event: AuditEvent) {
        if let Err(e) = self.sender.send(event).await {
            error!("failed to hand audit event to background worker: {}", e);
        }
    }
}

/// Consumes queued events and writes them through the underlying sink.
pub struct AuditWorker {
    receiver: mpsc::Receiver<AuditEvent>,
    delegate: Arc<dyn AuditLogger>,
}

impl AuditWorker {
    pub fn new(receiver: mpsc::Receiver<AuditEvent>, delegate: Arc<dyn AuditLogger>) -> Self {
        Self { receiver, delegate }
    }

    pub async fn run(mut self) {
        info!("audit background worker started");
        while let Some(event) = self.receiver.recv().await {
            self.delegate.log(event).await;
        }
        info!("audit background worker stopped");
    }
}
