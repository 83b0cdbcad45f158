//! Application configuration
//!
//! Stored as JSON; every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::bridge::BridgeConfig;
use crate::protocol::SerialConfig;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link settings
    pub serial: SerialConfig,
    /// Terminal bridge settings
    pub bridge: BridgeConfig,
    /// Prompt wait used by `ensure_idle`
    pub ensure_idle_timeout_ms: u64,
    /// Output wait used by `exec`
    pub exec_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            bridge: BridgeConfig::default(),
            ensure_idle_timeout_ms: 3000,
            exec_timeout_ms: 8000,
        }
    }
}

impl AppConfig {
    /// Parse from a JSON string
    pub fn from_json(text: &str) -> io::Result<Self> {
        serde_json::from_str(text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Write as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// [`ensure_idle_timeout_ms`](Self::ensure_idle_timeout_ms) as a duration
    pub fn ensure_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.ensure_idle_timeout_ms)
    }

    /// [`exec_timeout_ms`](Self::exec_timeout_ms) as a duration
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}
