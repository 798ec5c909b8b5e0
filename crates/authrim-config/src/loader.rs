//! Process-level settings (bind address, backing stores) loaded from files
//! and environment. Runtime keys resolve through [`crate::ConfigProvider`]
//! instead; this covers only what has to exist before the provider does.

use config::{Config, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSettings {
    /// MySQL URL for the relational mirrors; mirrors are no-ops when unset.
    pub mysql_url: Option<Secret<String>>,
    /// Redis URL for the L2 cache; in-memory only when unset.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_server")]
    pub server: ServerSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

fn default_server() -> ServerSettings {
    ServerSettings {
        host: default_host(),
        port: default_port(),
    }
}

impl AppSettings {
    pub fn load(config_dir: &str, environment: &str) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            .add_source(File::with_name(&format!("{config_dir}/local")).required(false))
            .add_source(
                Environment::with_prefix("AUTHRIM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
