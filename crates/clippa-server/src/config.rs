//! Server configuration.

use clippa_core::security::DEFAULT_SECRET_COST;
use clippa_party::{HubConfig, RetentionPolicy, TokenConfig};

use crate::session::SessionConfig;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`, `0` picks a free port).
    pub port: u16,
    pub hub: HubConfig,
    pub session: SessionConfig,
    /// Whether empty party hubs are kept or dropped.
    pub retention: RetentionPolicy,
    pub token: TokenConfig,
    /// bcrypt cost for newly created party secrets.
    pub secret_cost: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            hub: HubConfig::default(),
            session: SessionConfig::default(),
            retention: RetentionPolicy::default(),
            token: TokenConfig::default(),
            secret_cost: DEFAULT_SECRET_COST,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
