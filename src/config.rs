use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::context::{STANDALONE_ISS, STANDALONE_LAUNCH};
use crate::launch::{CLIENT_ID, LAUNCH_SCOPE};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub client_id: String,
    pub scope: String,
    /// FDC3 desktop-agent endpoint; no broadcasts when unset
    pub bus_endpoint: Option<String>,
    pub request_timeout_secs: u64,

    // Launch re-entered by a session reset
    pub standalone_iss: String,
    pub standalone_launch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            client_id: CLIENT_ID.to_string(),
            scope: LAUNCH_SCOPE.to_string(),
            bus_endpoint: None,
            request_timeout_secs: 30,
            standalone_iss: STANDALONE_ISS.to_string(),
            standalone_launch: STANDALONE_LAUNCH.to_string(),
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".smartbridge"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Session storage file shared by the runs of one launch
    pub fn session_store_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("session.json"))
    }

    /// Load config from the default location or return default
    pub fn load_or_default() -> Self {
        match Self::config_path().and_then(|path| Self::load(&path)) {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from file, or default if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
