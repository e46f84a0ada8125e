//! The `copy` driver: ingest a local source tree under a virtual path.

use std::fs;
use std::path::Path;

use tracing::info;

use seedfs_meta::{DirId, PathLookup};

use crate::{sorted_entries, IngestError, Ingestor, PendingFile, Result};

impl Ingestor {
    /// Ingest the tree rooted at `src` under the virtual path `dst`, then
    /// wait for every produced block's upload and persist all state.
    ///
    /// Refuses with [`IngestError::AlreadyExists`] when any name from the
    /// source tree is already taken under the destination.
    pub fn copy_tree(&self, src: &Path, dst: &str, metadata_file: &Path) -> Result<()> {
        let dst = dst.strip_suffix('/').unwrap_or(dst);
        let start_blocks = self.meta.lock().unwrap().blocks.len();

        let lookup = self.meta.lock().unwrap().lookup_path(dst);
        let dst_id = match lookup {
            PathLookup::Found(id) => {
                if self.check_exists(id, src)? {
                    return Err(IngestError::AlreadyExists);
                }
                id
            }
            PathLookup::NotDir => return Err(IngestError::AlreadyExists),
            PathLookup::Missing => self.meta.lock().unwrap().ensure_dir_path(dst),
        };
        info!(src = %src.display(), dst, "copy started");

        let leftovers = self.collect_tree(dst_id, src)?;
        self.pack_small_files(leftovers, true, false)?;
        self.wait_uploads_settled(start_blocks);
        self.persist(metadata_file)?;
        info!(src = %src.display(), dst, "copy complete");
        Ok(())
    }

    /// Does any entry of the source tree collide with an existing name under
    /// `dir`? Existing subdirectories are descended, everything else is a
    /// conflict.
    fn check_exists(&self, dir: DirId, path: &Path) -> Result<bool> {
        for entry in sorted_entries(path)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (file_hit, child) = {
                let meta = self.meta.lock().unwrap();
                (
                    meta.child_file(dir, &name).is_some(),
                    meta.child_dir(dir, &name),
                )
            };
            if file_hit {
                return Ok(true);
            }
            if let Some(child) = child {
                let p = entry.path();
                if p.is_dir() {
                    if self.check_exists(child, &p)? {
                        return Ok(true);
                    }
                } else {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Depth-first walk: create or reuse destination directories, register
    /// every regular file, route large files to the splitter and batch the
    /// small ones. Each level packs what it can and passes leftovers up.
    pub(crate) fn collect_tree(&self, dir: DirId, path: &Path) -> Result<Vec<PendingFile>> {
        let mut batch = Vec::new();
        for entry in sorted_entries(path)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let p = entry.path();
            let md = fs::metadata(&p)?;
            if md.is_dir() {
                let child = {
                    let mut meta = self.meta.lock().unwrap();
                    match meta.child_dir(dir, &name) {
                        Some(c) => c,
                        None => meta.add_dir(dir, &name),
                    }
                };
                batch.extend(self.collect_tree(child, &p)?);
            } else {
                let size = md.len();
                let id = {
                    let mut meta = self.meta.lock().unwrap();
                    let id = meta.add_file(dir, &name);
                    meta.files[id as usize].size = size;
                    id
                };
                if size >= self.limits.min_block {
                    self.add_large_file(id, size, &p, false)?;
                } else {
                    batch.push(PendingFile { id, size, path: p });
                }
            }
        }
        self.pack_small_files(batch, false, false)
    }
}
