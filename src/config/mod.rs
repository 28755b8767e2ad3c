use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BackhaulError, Result};

/// Server configuration, loaded from a YAML file next to the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shared secret expected in the `X-API-Key` header and on the transfer
    /// ports.
    #[serde(default = "default_api_key")]
    pub api_key: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_download_port")]
    pub download_port: u16,

    #[serde(default = "default_upload_port")]
    pub upload_port: u16,

    /// Budget for a queued command, including its approval wait. Default: 120.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Budget for remote reads and lists. Default: 60.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Budget for remote writes, including their approval wait. Default: 180.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Ceiling on `/fs/read` content when the caller gives no `max_size`.
    #[serde(default = "default_max_read_size")]
    pub max_read_size: usize,

    /// Largest file accepted on the bulk-transfer ports. Default: 50 MiB.
    #[serde(default = "default_max_transfer_bytes")]
    pub max_transfer_bytes: u64,

    /// Root directory the transfer ports and bundling are confined to.
    /// Defaults to the system temp directory.
    #[serde(default = "default_transfer_root")]
    pub transfer_root: PathBuf,
}

fn default_api_key() -> String {
    "change-me-in-production".to_string()
}
fn default_api_port() -> u16 {
    5000
}
fn default_download_port() -> u16 {
    5001
}
fn default_upload_port() -> u16 {
    5002
}
fn default_command_timeout() -> u64 {
    120
}
fn default_read_timeout() -> u64 {
    60
}
fn default_write_timeout() -> u64 {
    180
}
fn default_max_read_size() -> usize {
    crate::fsops::DEFAULT_MAX_READ_SIZE
}
fn default_max_transfer_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_transfer_root() -> PathBuf {
    std::env::temp_dir()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            api_port: default_api_port(),
            download_port: default_download_port(),
            upload_port: default_upload_port(),
            command_timeout_secs: default_command_timeout(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_read_size: default_max_read_size(),
            max_transfer_bytes: default_max_transfer_bytes(),
            transfer_root: default_transfer_root(),
        }
    }
}

impl ServerConfig {
    /// Load config from a YAML file. Returns defaults if the file doesn't
    /// exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| BackhaulError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
