//! Engine configuration.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory. `None` keeps every root in memory.
    pub path: Option<PathBuf>,

    /// Per-store value cache size (number of values) for file backings.
    pub value_cache_size: usize,

    /// Log each fold batch, or each undo entry of the undo-log engine,
    /// before touching any backing.
    pub checkpoint: bool,

    /// Fsync a file backing every N batches (0 or 1 = every batch).
    pub sync_interval: u64,

    /// Layers kept above the root before `flush_if_needed` folds the excess.
    /// Owned by consensus; `None` disables automatic folding.
    pub max_revocable_depth: Option<usize>,

    /// Event buffer per subscriber.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            value_cache_size: 1000,
            checkpoint: true,
            sync_interval: 1,
            max_revocable_depth: None,
            event_buffer: 1000,
        }
    }
}

impl EngineConfig {
    /// In-memory configuration.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_max_revocable_depth(mut self, depth: usize) -> Self {
        self.max_revocable_depth = Some(depth);
        self
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.value_cache_size == 0 {
            return Err(StoreError::InvalidConfig(
                "value_cache_size must be positive".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(StoreError::InvalidConfig("event_buffer must be positive".into()));
        }
        if self.max_revocable_depth == Some(0) {
            return Err(StoreError::InvalidConfig(
                "max_revocable_depth must keep at least one layer".into(),
            ));
        }
        Ok(())
    }
}
