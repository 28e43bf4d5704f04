//! TOML configuration.
//!
//! ```toml
//! [session]
//! connect_timeout_ms = 5000
//! command_timeout_ms = 10000
//!
//! [transfer]
//! settle_delay_ms = 1500
//!
//! [sync]
//! log_batch_size = 500
//! grace_period_ms = 3000
//! lock_timeout_ms = 30000   # omit to wait indefinitely
//!
//! [store]
//! path = "/var/lib/attsync/store.lst"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::DEFAULT_TICKS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Tick byte mixed into the auth challenge.
    pub auth_ticks: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 10_000,
            auth_ticks: DEFAULT_TICKS,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Wait after `Refresh` before the firmware has committed writes.
    pub settle_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1_500,
        }
    }
}

impl TransferConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub log_batch_size: usize,
    /// How long `complete`/`error` stays visible before the state resets.
    pub grace_period_ms: u64,
    /// Bound on waiting for the fingerprint lock. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            log_batch_size: 500,
            grace_period_ms: 3_000,
            lock_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

impl Config {
    /// Default config file location (`~/.config/attsync/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("attsync").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from [`Config::default_path`], or defaults if there is no file.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sync.log_batch_size == 0 {
            anyhow::bail!("sync.log_batch_size must be at least 1");
        }
        if self.session.command_timeout_ms == 0 || self.session.connect_timeout_ms == 0 {
            anyhow::bail!("session timeouts must be non-zero");
        }
        Ok(())
    }
}
