//! Engine configuration.
//!
//! A missing file yields `EngineConfig::default()`. All fields use
//! `#[serde(default)]` so any subset of keys can be specified; unknown keys
//! are ignored.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Size cap on the config file; anything larger is rejected before parsing.
const MAX_CONFIG_SIZE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

/// Engine defaults and transport knobs.
///
/// The update/expiry defaults apply to every feed in `Inherit` mode and can
/// be changed at runtime through the context, which propagates them
/// immediately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default update interval in seconds for `Inherit`-mode feeds.
    pub update_interval_secs: i64,

    /// Whether `Inherit`-mode feeds are updated automatically.
    pub update_enabled: bool,

    /// Default article expiry age in seconds. 0 = never expire.
    pub expire_age_secs: i64,

    /// Cadence of the scheduler sweep.
    pub sweep_resolution_secs: u64,

    /// Per-request fetch timeout.
    pub fetch_timeout_secs: u64,

    /// Response body cap for feed fetches.
    pub max_response_bytes: usize,

    /// Shared ceiling for redirects and discovery retries per update cycle.
    pub max_hops: u32,

    /// Article count served by the highlights view.
    pub highlights_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 3600,
            update_enabled: true,
            expire_age_secs: 0,
            sweep_resolution_secs: 60,
            fetch_timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
            max_hops: 10,
            highlights_limit: 30,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > MAX_CONFIG_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "{} bytes (max {})",
                    meta.len(),
                    MAX_CONFIG_SIZE
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        }

        let content = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&content)?)
    }
}
