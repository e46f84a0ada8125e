//! # seedfs-ingest
//!
//! The ingest side of seedfs: turning local trees into content-addressed
//! blocks.
//!
//! Small files are accumulated size-ascending and packed together into
//! blocks; large files are split into equal chunks. Both paths deduplicate by
//! whole-file SHA-512 before producing any block. Finished blocks are staged
//! under the temp directory and handed to upload workers; each worker writes
//! the remote handle back onto its block record when the upload lands.

mod assemble;
mod copy;
mod fix;
pub mod hash;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seedfs_backend::Backend;
use seedfs_config::Limits;
use seedfs_meta::{BlockId, FsMeta};

/// Errors from the ingest drivers.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The destination already holds an entry the ingest would overwrite.
    #[error("destination already exists")]
    AlreadyExists,

    #[error("no such destination: {0}")]
    NotFound(String),

    #[error(transparent)]
    Meta(#[from] seedfs_meta::MetaError),

    #[error("backend state error: {0}")]
    Backend(#[from] seedfs_backend::StoreError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// A small file waiting to be packed into a shared block.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: seedfs_meta::FileId,
    pub size: u64,
    pub path: PathBuf,
}

/// Shared context for the `copy` and `fix` drivers.
pub struct Ingestor {
    pub(crate) meta: Arc<Mutex<FsMeta>>,
    pub(crate) backend: Arc<Backend>,
    pub(crate) tmp_dir: PathBuf,
    pub(crate) limits: Limits,
}

impl Ingestor {
    pub fn new(
        meta: Arc<Mutex<FsMeta>>,
        backend: Arc<Backend>,
        tmp_dir: &Path,
        limits: Limits,
    ) -> Result<Self> {
        fs::create_dir_all(tmp_dir)?;
        Ok(Self {
            meta,
            backend,
            tmp_dir: tmp_dir.to_path_buf(),
            limits,
        })
    }

    pub(crate) fn stage_path(&self, id: BlockId) -> PathBuf {
        self.tmp_dir.join(id.to_string())
    }

    /// Persist the metadata graph and backend state.
    pub fn persist(&self, metadata_file: &Path) -> Result<()> {
        self.meta.lock().unwrap().save(metadata_file)?;
        self.backend.save()?;
        Ok(())
    }

    /// Wait until every block created at index `start` or later either has
    /// its remote handle or is referenced by no file. Rechecks every two
    /// seconds; upload workers write handles back asynchronously.
    pub fn wait_uploads_settled(&self, start: usize) {
        loop {
            if self.uploads_settled(start) {
                return;
            }
            std::thread::sleep(Duration::from_secs(2));
        }
    }

    fn uploads_settled(&self, start: usize) -> bool {
        let meta = self.meta.lock().unwrap();
        let refs = meta.block_ref_counts();
        meta.blocks
            .iter()
            .enumerate()
            .skip(start)
            .all(|(i, b)| !b.source.is_empty() || refs[i] == 0)
    }
}

/// Directory entries sorted by name, so pack order is deterministic across
/// runs and platforms.
pub(crate) fn sorted_entries(path: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(path)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}
