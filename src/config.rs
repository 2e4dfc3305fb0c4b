//! Store configuration
//!
//! Loaded from TOML, e.g.
//!
//! ```toml
//! data_dir = "/var/lib/diskstore"
//! requested_bytes = 1048576
//! reserve_retries = 5
//! ```

use crate::error::{Error, Result};
use crate::storage::bitmap::DEFAULT_RESERVE_RETRIES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for opening a [`SlotStore`](crate::SlotStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `metadata.ds` and `metadata_lookup.ds`
    pub data_dir: PathBuf,
    /// Minimum metadata file size (rounded up to a whole page)
    pub requested_bytes: u64,
    /// CAS attempts per candidate bit before the allocator moves on
    pub reserve_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/diskstore"),
            requested_bytes: 4096,
            reserve_retries: DEFAULT_RESERVE_RETRIES,
        }
    }
}

impl StoreConfig {
    /// Config for `data_dir` with default sizing
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Set the requested metadata file size
    pub fn with_requested_bytes(mut self, requested_bytes: u64) -> Self {
        self.requested_bytes = requested_bytes;
        self
    }

    /// Set the per-bit retry budget of the allocator
    pub fn with_reserve_retries(mut self, reserve_retries: usize) -> Self {
        self.reserve_retries = reserve_retries;
        self
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse store config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io("read config", path, e))?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reserve_retries == 0 {
            return Err(Error::Config(
                "reserve_retries must be at least 1".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.requested_bytes, 4096);
        assert_eq!(config.reserve_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() -> Result<()> {
        let config = StoreConfig::from_toml_str("data_dir = \"/tmp/ds\"\nrequested_bytes = 20000\n")?;
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ds"));
        assert_eq!(config.requested_bytes, 20000);
        assert_eq!(config.reserve_retries, DEFAULT_RESERVE_RETRIES);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            StoreConfig::from_toml_str("reserve_retries = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("requested_bytes = \"lots\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("create temp dir", "tmp", e))?;
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "reserve_retries = 9\n").map_err(|e| Error::io("write", &path, e))?;

        let config = StoreConfig::load(&path)?;
        assert_eq!(config.reserve_retries, 9);
        assert_eq!(config.data_dir, PathBuf::from("data/diskstore"));
        Ok(())
    }
}
