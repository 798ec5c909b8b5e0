//! Domain events, audit records and the background-completion pool.

pub mod audit;
pub mod bus;
pub mod wait_until;

pub use audit::{AuditEvent, AuditLogger, AuditOutcome, AuditWorker, AsyncAuditLogger, TracingAuditLogger};
pub use bus::{event_types, ChannelEventBus, DomainEvent, EventBus, EventWorker, TracingEventBus};
pub use wait_until::WaitUntil;
