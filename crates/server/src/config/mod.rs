mod client;
mod server;
mod session;
mod store;
mod telemetry;

#[cfg(test)]
mod tests;

pub use client::*;
pub use server::*;
pub use session::*;
pub use store::*;
pub use telemetry::*;

use serde::Deserialize;

use crate::error::ServerError;

/// Top-level configuration for the Tether server, loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    /// HTTP server bind configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Frontend static file configuration.
    #[serde(default)]
    pub ui: UiConfig,
    /// Session store backend configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Managed session configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// External messaging client process.
    #[serde(default)]
    pub client: ClientConfig,
    /// Log filtering and OTLP span export.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl TetherConfig {
    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.session.backup_interval_seconds < MIN_BACKUP_INTERVAL_SECONDS {
            return Err(ServerError::Config(format!(
                "session.backup_interval_seconds must be at least {MIN_BACKUP_INTERVAL_SECONDS}"
            )));
        }
        if self.store.chunk_size_bytes == 0 {
            return Err(ServerError::Config(
                "store.chunk_size_bytes must be greater than zero".into(),
            ));
        }
        if self.client.command.trim().is_empty() {
            return Err(ServerError::Config("client.command must not be empty".into()));
        }
        if !self.telemetry.sample_ratio_is_valid() {
            return Err(ServerError::Config(
                "telemetry.sample_ratio must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}
