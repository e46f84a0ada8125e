//! The `mount` command.

use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use seedfs_cache::BlockCache;
use seedfs_config::Config;
use seedfs_fuse::SeedFs;

use crate::context;

pub fn run(config: &Config) -> Result<()> {
    let (meta, backend) = context::load(config)?;
    context::ensure_tokens(&backend)?;

    fs::create_dir_all(&config.mount_point)
        .with_context(|| format!("creating mountpoint {}", config.mount_point.display()))?;
    let cache = BlockCache::new(
        meta.clone(),
        backend.clone(),
        &config.cache_dir,
        config.cache_limit,
    )?;

    info!(
        mountpoint = %config.mount_point.display(),
        cache = %config.cache_dir.display(),
        limit = config.cache_limit,
        "serving read-only"
    );
    let seedfs = SeedFs::new(meta, cache, backend, &config.metadata_file);
    seedfs.mount(&config.mount_point)
}
