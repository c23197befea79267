//! System-wide tunnel settings
//!
//! Settings that apply to every tunnel a context brings up, as opposed to
//! the per-tunnel `[Interface]` / `[Peer]` configuration. Can be loaded
//! from TOML or JSON:
//!
//! ```toml
//! handshake_timeout_secs = 180
//! connect_timeout_secs = 12
//! default_mtu = 1420
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by all tunnels of a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfiguration {
    /// A peer with no completed handshake for this long is considered lost
    pub handshake_timeout_secs: u64,
    /// How long to wait for the first handshake response
    pub connect_timeout_secs: u64,
    /// MTU for interfaces that do not set one
    pub default_mtu: Option<u16>,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 180,
            connect_timeout_secs: 12,
            default_mtu: None,
        }
    }
}

impl SystemConfiguration {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, SystemConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => return Err(SystemConfigError::UnsupportedFormat),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| SystemConfigError::Io(e.to_string()))?;
        Self::from_str_as(&content, format)
    }

    /// Load from a string in the given format
    pub fn from_str_as(content: &str, format: ConfigFormat) -> Result<Self, SystemConfigError> {
        match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| SystemConfigError::Parse(e.to_string()))
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| SystemConfigError::Parse(e.to_string()))
            }
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// System configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SystemConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}
