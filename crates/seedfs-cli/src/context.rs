//! Shared state construction for the commands.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use seedfs_backend::{Backend, Connector, DirStore, ObjectStore};
use seedfs_config::Config;
use seedfs_meta::FsMeta;

/// Connector for the built-in directory store: a token is the store root.
/// Other store implementations are wired in here.
fn connector() -> Connector {
    Box::new(|token| {
        Ok(Arc::new(DirStore::open(Path::new(token))?) as Arc<dyn ObjectStore>)
    })
}

/// Backend facade over the persisted token pool, not yet loaded.
pub fn backend(config: &Config) -> Backend {
    Backend::new(
        config.tokens_file.clone(),
        config.dirmap_file.clone(),
        config.remote_root.clone(),
        connector(),
    )
}

/// Load metadata and backend state from disk.
pub fn load(config: &Config) -> Result<(Arc<Mutex<FsMeta>>, Arc<Backend>)> {
    let meta = FsMeta::load(&config.metadata_file)
        .with_context(|| format!("loading {}", config.metadata_file.display()))?;
    let backend = backend(config);
    backend.load().context("loading backend state")?;
    Ok((Arc::new(Mutex::new(meta)), Arc::new(backend)))
}

/// Refuse to start an operation that would stall on an empty pool.
pub fn ensure_tokens(backend: &Backend) -> Result<()> {
    anyhow::ensure!(
        backend.handle_count() > 0,
        "no backend tokens configured; run `seedfs drive addtoken <token>` first"
    );
    Ok(())
}
