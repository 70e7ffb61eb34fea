//! Worker Configuration
//!
//! Service, recognizer and logging settings stored in TOML format. Every field has a
//! default, so a partial file is valid.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::MAX_FRAME_BYTES;
use crate::recognition::DEFAULT_IDLE_TIMEOUT;
use crate::service::supervisor::DEFAULT_CHECK_INTERVAL;

/// Worker settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Service loop and idle handling
    pub service: ServiceConfig,
    /// Recognizer backend
    pub recognizer: RecognizerConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Service loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Release the recognizer after this many idle seconds
    pub idle_timeout_secs: u64,
    /// Seconds between idle checks
    pub idle_check_interval_secs: u64,
    /// Largest accepted frame payload
    pub max_frame_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            idle_check_interval_secs: DEFAULT_CHECK_INTERVAL.as_secs(),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl ServiceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Check interval, never zero
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}

/// Recognizer backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Model directory; the platform data directory when unset
    pub models_dir: Option<PathBuf>,
    /// Download missing models on first use
    pub auto_download: bool,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            auto_download: true,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`info`, `debug`, `ocr_worker=trace`, ...)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: WorkerConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &WorkerConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
