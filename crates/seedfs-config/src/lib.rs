//! # seedfs-config
//!
//! Deployment configuration for seedfs.
//!
//! Loads `seedfs.toml` from the working directory when present, otherwise
//! falls back to the built-in defaults. Every path is relative to the
//! directory the process runs in; a deployment is one directory holding the
//! mountpoint, the cache, the temp area and the persisted state files.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default block/cache thresholds.
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
pub const MAX_BLOCK_SIZE: u64 = 512 * 1024 * 1024;
pub const CACHE_LIMIT: u64 = 1024 * 1024 * 1024 * 1024;

/// Config file looked up next to the working directory.
pub const CONFIG_FILE: &str = "seedfs.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Block sizing thresholds for the ingest pipeline.
///
/// Files at or above `min_block` are split into chunks of at most
/// `max_block` bytes; smaller files are packed together until a pending
/// buffer reaches `min_block`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub min_block: u64,
    pub max_block: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_block: MIN_BLOCK_SIZE,
            max_block: MAX_BLOCK_SIZE,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the filesystem is mounted on.
    pub mount_point: PathBuf,
    /// Persisted filesystem metadata.
    pub metadata_file: PathBuf,
    /// Local block cache directory.
    pub cache_dir: PathBuf,
    /// Staging area for blocks awaiting upload.
    pub tmp_dir: PathBuf,
    /// Persisted backend tokens (one per pooled service handle).
    pub tokens_file: PathBuf,
    /// Persisted remote directory map.
    pub dirmap_file: PathBuf,
    /// Root container on the remote store all uploads land under.
    pub remote_root: String,
    /// High-water mark for the local block cache, in bytes.
    pub cache_limit: u64,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("mnt"),
            metadata_file: PathBuf::from("fs_data"),
            cache_dir: PathBuf::from("cache"),
            tmp_dir: PathBuf::from("tmp"),
            tokens_file: PathBuf::from("store_tokens"),
            dirmap_file: PathBuf::from("store_dirmap"),
            remote_root: String::new(),
            cache_limit: CACHE_LIMIT,
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Load config from `seedfs.toml` in the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load config from an explicit file path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
