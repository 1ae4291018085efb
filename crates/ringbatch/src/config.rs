//! Configuration for chunked batching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of requests per batch
pub const DEFAULT_MAX_ENTRIES: usize = 3000;

/// Largest request count per batch (a write batch adds one barrier entry and
/// the kernel caps a ring at 32768 entries)
pub const MAX_BATCH_ENTRIES: usize = 32767;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_entries` outside `1..=MAX_BATCH_ENTRIES`
    #[error("max_entries must be between 1 and {max}, got {0}", max = MAX_BATCH_ENTRIES)]
    InvalidMaxEntries(usize),
}

/// Chunked batching configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of requests submitted in one batch
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

impl BatchConfig {
    /// Create a configuration with the given batch size
    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if `max_entries` is zero or too large for one ring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 || self.max_entries > MAX_BATCH_ENTRIES {
            return Err(ConfigError::InvalidMaxEntries(self.max_entries));
        }
        Ok(())
    }

    /// Batch size actually used, clamped into the valid range
    #[must_use]
    pub fn effective_max_entries(&self) -> usize {
        self.max_entries.clamp(1, MAX_BATCH_ENTRIES)
    }
}
