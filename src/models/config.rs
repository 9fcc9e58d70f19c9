// src/models/config.rs

//! Application configuration structures.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::PartitionStrategy;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Collection behavior settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Window partitioning settings
    #[serde(default)]
    pub partition: PartitionConfig,

    /// Output locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Account credentials, one worker per account
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.collector.batch_size == 0 {
            return Err(AppError::config("collector.batch_size must be > 0"));
        }
        if self.collector.request_timeout_secs == 0 {
            return Err(AppError::config("collector.request_timeout_secs must be > 0"));
        }
        if self.collector.service_url.trim().is_empty() {
            return Err(AppError::config("collector.service_url is empty"));
        }
        if self.partition.overlap_percent > 50 {
            return Err(AppError::config("partition.overlap_percent must be 0-50"));
        }
        if self.partition.strategy == PartitionStrategy::Custom
            && self.partition.custom_windows.is_empty()
        {
            return Err(AppError::config(
                "partition.custom_windows required for the custom strategy",
            ));
        }
        Ok(())
    }
}

/// Collection behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL of the AT Protocol service
    #[serde(default = "defaults::service_url")]
    pub service_url: String,

    /// Items per durable batch
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Delay between API calls within one worker, in milliseconds
    #[serde(default = "defaults::rate_limit_delay")]
    pub rate_limit_delay_ms: u64,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub request_timeout_secs: u64,

    /// Retry attempts for transient API failures
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Thread depth requested when fetching reply trees
    #[serde(default = "defaults::thread_depth")]
    pub thread_depth: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            service_url: defaults::service_url(),
            batch_size: defaults::batch_size(),
            rate_limit_delay_ms: defaults::rate_limit_delay(),
            request_timeout_secs: defaults::timeout(),
            max_retries: defaults::max_retries(),
            thread_depth: defaults::thread_depth(),
        }
    }
}

/// Window partitioning settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartitionConfig {
    /// Partition strategy
    #[serde(default)]
    pub strategy: PartitionStrategy,

    /// Overlap percentage for the overlap strategy (0-50)
    #[serde(default = "defaults::overlap_percent")]
    pub overlap_percent: u8,

    /// Explicit windows for the custom strategy
    #[serde(default)]
    pub custom_windows: Vec<CustomWindow>,
}

/// An explicit `(start, end)` pair for the custom strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory for all collected data
    #[serde(default = "defaults::data_dir")]
    pub data_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: defaults::data_dir(),
        }
    }
}

/// One account, mapped to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub app_password: Option<String>,
}

mod defaults {
    pub fn service_url() -> String {
        "https://bsky.social".into()
    }
    pub fn batch_size() -> usize {
        100
    }
    pub fn rate_limit_delay() -> u64 {
        100
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn thread_depth() -> u32 {
        10
    }
    pub fn overlap_percent() -> u8 {
        10
    }
    pub fn data_dir() -> String {
        "data".into()
    }
}
