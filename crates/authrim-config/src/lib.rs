//! Configuration: single hierarchical provider (durable KV > environment >
//! default) and the per-tenant policy profile.

pub mod keys;
pub mod loader;
pub mod provider;
pub mod tenant;

pub use loader::{AppSettings, ServerSettings, StoreSettings};
pub use provider::{ConfigError, ConfigProvider, KvStore, MemoryKvStore};
pub use tenant::{
    IdJagSettings, LogoutSettings, NativeSsoSettings, OverflowPolicy, TenantProfile,
    TokenExchangeSettings,
};
