use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::media::wav::HeaderValidation;
use crate::playback::paced::DEFAULT_LATENCY_MS;
use crate::playback::session::SessionPolicy;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub assets: AssetsConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AssetsConfig {
    #[serde(default = "default_assets_root")]
    pub root: PathBuf,

    #[serde(default = "default_category")]
    pub category: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root: default_assets_root(),
            category: default_category(),
        }
    }
}

/// Which output binding plays the audio.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// Real-time software sink, no sound
    #[default]
    Paced,
    /// Default system device (needs the `cpal` feature)
    Device,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub policy: SessionPolicy,

    #[serde(default)]
    pub output: OutputBackend,

    #[serde(default)]
    pub header_validation: HeaderValidation,

    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::default(),
            output: OutputBackend::default(),
            header_validation: HeaderValidation::default(),
            latency_ms: default_latency_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions for serde
fn default_bind_addr() -> String {
    "[::]:3000".to_string()
}
fn default_true() -> bool {
    true
}
fn default_assets_root() -> PathBuf {
    PathBuf::from("assets")
}
fn default_category() -> String {
    "wav_test_files".to_string()
}
fn default_latency_ms() -> u32 {
    DEFAULT_LATENCY_MS
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise defaults, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // Override with environment variables
        if let Ok(bind_addr) = std::env::var("WAVPLAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }

        if let Ok(root) = std::env::var("WAVPLAY_ASSETS_ROOT") {
            config.assets.root = PathBuf::from(root);
        }

        if let Ok(log_level) = std::env::var("WAVPLAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.assets.category.trim().is_empty() {
            anyhow::bail!("assets.category must not be empty");
        }

        if self.playback.latency_ms == 0 {
            anyhow::bail!("playback.latency_ms must be greater than zero");
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        Ok(())
    }
}
