//! Runtime configuration.
//!
//! A small TOML file tunes the allocator and patching strategy. Lookup order:
//! the `DIVERT_CONFIG` environment variable, then `divert.toml` in the
//! working directory. Absent or malformed files fall back to defaults so the
//! library stays usable with zero setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Core tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Size of one trampoline code slice in bytes.
    pub code_slice_size: usize,

    /// Slices per allocator slab.
    pub slices_per_slab: usize,

    /// Always publish prologue writes through the dual-mapping segment, even
    /// where RWX pages are permitted.
    pub force_staged_commit: bool,

    /// Default `tracing` filter installed by embedders that ask the shim to
    /// set up logging.
    pub log_filter: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            code_slice_size: 1024,
            slices_per_slab: 32,
            force_staged_commit: false,
            log_filter: None,
        }
    }
}

impl CoreConfig {
    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Load from the configured location, falling back to defaults.
    pub fn load_or_default() -> Self {
        let path = std::env::var_os("DIVERT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("divert.toml"));
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::debug!(?path, "loaded config");
                config
            }
            Err(err) => {
                tracing::warn!(?path, %err, "ignoring bad config file");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert!(config.code_slice_size >= 512);
        assert!(config.slices_per_slab > 0);
        assert!(!config.force_staged_commit);
    }

    #[test]
    fn parses_partial_toml() {
        let config: CoreConfig = toml::from_str("code_slice_size = 2048").unwrap();
        assert_eq!(config.code_slice_size, 2048);
        assert_eq!(config.slices_per_slab, CoreConfig::default().slices_per_slab);
    }
}
