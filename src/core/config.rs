//! Store configuration

use crate::error::{CfstoreError, Result};
use crate::record::{CHUNK_SIZE, HEADER_SIZE, KEY_REGION_MAX, TAIL_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime tunables of a [`ConfigStore`](crate::ConfigStore)
///
/// ```
/// use cfstore::StoreConfig;
///
/// let config = StoreConfig::from_toml_str(r#"
///     fragment_payload_max = 256
///     max_open_handles = 8
/// "#).unwrap();
/// assert_eq!(config.fragment_payload_max, 256);
/// assert_eq!(config.read_cache_capacity, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Largest value payload stored in one fragment (multiple of the chunk size)
    pub fragment_payload_max: usize,

    /// Maximum number of simultaneously open handles
    pub max_open_handles: usize,

    /// Decoded fragments kept in the read cache (0 disables it)
    pub read_cache_capacity: usize,

    /// Sync the medium after every committed generation
    pub sync_on_close: bool,

    /// Erase unpinned superseded generations when allocation fails
    pub reclaim_on_exhaustion: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            fragment_payload_max: 512,
            max_open_handles: 64,
            read_cache_capacity: 32,
            sync_on_close: true,
            reclaim_on_exhaustion: true,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| CfstoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| CfstoreError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.fragment_payload_max == 0 || self.fragment_payload_max % CHUNK_SIZE != 0 {
            return Err(CfstoreError::InvalidConfig(format!(
                "fragment_payload_max must be a non-zero multiple of {} (got {})",
                CHUNK_SIZE, self.fragment_payload_max
            )));
        }
        if self.fragment_payload_max > u32::MAX as usize - (HEADER_SIZE + KEY_REGION_MAX + TAIL_SIZE) {
            return Err(CfstoreError::InvalidConfig(format!(
                "fragment_payload_max too large ({})",
                self.fragment_payload_max
            )));
        }
        if self.max_open_handles == 0 {
            return Err(CfstoreError::InvalidConfig(
                "max_open_handles must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
