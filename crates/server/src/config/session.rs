use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use tether_core::SessionId;

/// Shortest accepted interval between periodic backups.
pub const MIN_BACKUP_INTERVAL_SECONDS: u64 = 60;

/// Configuration of the managed messaging session.
///
/// # Example
///
/// ```toml
/// [session]
/// id = "main"
/// data_path = "./.tether"
/// backup_interval_seconds = 300
/// ```
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Session id used for the store record and local file names.
    #[serde(default)]
    pub id: SessionId,
    /// Local working directory for the profile and temporary archives.
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// Seconds between periodic backups while the client is authenticated.
    #[serde(default = "default_backup_interval")]
    pub backup_interval_seconds: u64,
    /// Restore the stored profile before starting the client.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
    /// Start the client automatically at boot when a stored session exists.
    #[serde(default = "default_true")]
    pub auto_init: bool,
    /// Delay before the automatic start, in seconds.
    #[serde(default = "default_auto_init_delay")]
    pub auto_init_delay_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: SessionId::default(),
            data_path: default_data_path(),
            backup_interval_seconds: default_backup_interval(),
            restore_on_start: true,
            auto_init: true,
            auto_init_delay_seconds: default_auto_init_delay(),
        }
    }
}

impl SessionConfig {
    /// `<data_path>/<id>.zip`
    pub fn archive_path(&self) -> PathBuf {
        PathBuf::from(&self.data_path).join(self.id.archive_file_name())
    }

    /// `<data_path>/session-<id>`
    pub fn profile_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_path).join(format!("session-{}", self.id))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_seconds)
    }
}

fn default_data_path() -> String {
    "./.tether".to_owned()
}

fn default_backup_interval() -> u64 {
    300
}

fn default_auto_init_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}
