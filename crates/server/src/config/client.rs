use std::collections::HashMap;

use serde::Deserialize;

/// External messaging client process.
///
/// The process speaks JSON lines: events on stdout, commands on stdin.
///
/// # Example
///
/// ```toml
/// [client]
/// command = "node"
/// args = ["client/index.js"]
///
/// [client.env]
/// HEADLESS = "true"
/// ```
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Executable to launch.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory. Defaults to the server's.
    pub working_dir: Option<String>,
    /// Seconds to wait for the process to exit after a shutdown command.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stop_timeout_seconds: default_stop_timeout(),
        }
    }
}

fn default_command() -> String {
    "tether-client".to_owned()
}

fn default_stop_timeout() -> u64 {
    10
}
