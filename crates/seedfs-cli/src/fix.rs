//! The `fix` command.

use std::fs;
use std::path::Path;

use anyhow::Result;
use console::style;

use seedfs_config::Config;
use seedfs_ingest::Ingestor;

use crate::context;

pub fn run(config: &Config, src: &Path, dst: &str) -> Result<()> {
    let (meta, backend) = context::load(config)?;
    context::ensure_tokens(&backend)?;

    let ingestor = Ingestor::new(meta, backend, &config.tmp_dir, config.limits)?;
    ingestor.fix_tree(src, dst, &config.mount_point, &config.metadata_file)?;

    let _ = fs::metadata(config.mount_point.join("__refresh__"));
    println!("{} {}", style("fixed").green(), dst);
    Ok(())
}
