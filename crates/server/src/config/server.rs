use serde::Deserialize;

/// HTTP server bind configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful shutdown timeout in seconds.
    ///
    /// Upper bound for the final session backup and client teardown once
    /// the listener has stopped.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8080
}

/// Frontend configuration.
#[derive(Debug, Deserialize)]
pub struct UiConfig {
    /// Whether to serve the frontend.
    #[serde(default = "default_ui_enabled")]
    pub enabled: bool,
    /// Path to the directory containing the built frontend static files.
    /// Defaults to `"ui/build"`.
    #[serde(default = "default_ui_dist")]
    pub dist_path: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: default_ui_enabled(),
            dist_path: default_ui_dist(),
        }
    }
}

fn default_ui_enabled() -> bool {
    true
}

fn default_ui_dist() -> String {
    "ui/build".to_owned()
}
