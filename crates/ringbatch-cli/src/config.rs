//! Configuration system for the ringbatch CLI.

use ringbatch::BatchConfig;
use ringbatch::request::MAX_REQUEST_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// ringbatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Batch sizing
    #[serde(default)]
    pub batch: BatchConfig,
    /// Request layout
    #[serde(default)]
    pub io: IoConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Request layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Bytes per request
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_block_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write this configuration as TOML to `path`, creating parent
    /// directories as needed.
    ///
    /// An existing file is only replaced when `overwrite` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and `overwrite` is false, or if it
    /// cannot be written.
    pub fn write_to(&self, path: &Path, overwrite: bool) -> anyhow::Result<()> {
        if path.exists() && !overwrite {
            anyhow::bail!(
                "{} already exists (use --force to replace it)",
                path.display()
            );
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ringbatch/config.toml")
    }

    /// Load config from the default path, or fall back to defaults if it
    /// doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file cannot be read.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.batch.validate()?;

        if self.io.block_size == 0 || self.io.block_size > MAX_REQUEST_LEN {
            anyhow::bail!("Block size must be between 1 byte and {} bytes", MAX_REQUEST_LEN);
        }

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
