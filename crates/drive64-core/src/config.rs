//! Drive configuration, loadable from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::bank::Bank;
use crate::protocol::constants::DEFAULT_RETRY_DELAY_MS;

/// Configuration for a drive session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Emit progress events after every chunk.
    pub progress: bool,
    /// Delay before each bulk retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-transfer USB timeout for the nusb backend, in milliseconds.
    pub io_timeout_ms: u64,
    /// Bank used when a transfer does not name one.
    pub bank: Bank,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            progress: true,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            io_timeout_ms: 5000,
            bank: Bank::CartRom,
        }
    }
}

impl DriveConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriveConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
