//! Logging setup shared by the seedfs binaries.
//!
//! Filter resolution order: `SEEDFS_LOG`, then `RUST_LOG`, then `warn`.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SEEDFS_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();
}
