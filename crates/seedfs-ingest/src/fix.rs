//! The `fix` driver: reconcile stored content against a local source.
//!
//! Both sides are re-hashed; diverging files are re-ingested with
//! deduplication disabled so the replacement gets fresh blocks and the old
//! content stays addressable through any other file sharing its hash.

use std::fs;
use std::path::Path;

use tracing::info;

use seedfs_meta::{DirId, PathLookup};

use crate::{hash, sorted_entries, IngestError, Ingestor, PendingFile, Result};

impl Ingestor {
    /// Verify `dst` (as served under `mount_point`) against the local `src`
    /// and re-ingest whatever differs, then wait out all uploads and persist.
    ///
    /// `src` may name a single file; it then replaces `dst` unconditionally.
    pub fn fix_tree(
        &self,
        src: &Path,
        dst: &str,
        mount_point: &Path,
        metadata_file: &Path,
    ) -> Result<()> {
        let dst = dst.strip_suffix('/').unwrap_or(dst);
        let start_blocks = self.meta.lock().unwrap().blocks.len();

        let batch = if fs::metadata(src)?.is_dir() {
            let lookup = self.meta.lock().unwrap().lookup_path(dst);
            let dst_id = match lookup {
                PathLookup::Found(id) => id,
                _ => return Err(IngestError::NotFound(dst.to_string())),
            };
            let mounted = mount_point.join(dst.trim_start_matches('/'));
            self.check_tree(&mounted, src, dst_id)?
        } else {
            let id = self
                .meta
                .lock()
                .unwrap()
                .resolve_file(dst)
                .ok_or_else(|| IngestError::NotFound(dst.to_string()))?;
            let size = fs::metadata(src)?.len();
            self.meta.lock().unwrap().files[id as usize].size = size;
            if size >= self.limits.min_block {
                self.add_large_file(id, size, src, true)?;
                Vec::new()
            } else {
                vec![PendingFile {
                    id,
                    size,
                    path: src.to_path_buf(),
                }]
            }
        };

        self.pack_small_files(batch, true, true)?;
        self.backend.wait_all();
        self.wait_uploads_settled(start_blocks);
        self.persist(metadata_file)?;
        info!(src = %src.display(), dst, "fix complete");
        Ok(())
    }

    /// Walk the source tree against its mounted counterpart. New entries are
    /// ingested as on `copy`; files present on both sides are re-hashed on
    /// both sides and collected for re-ingest when the hashes differ.
    fn check_tree(&self, mounted: &Path, src: &Path, dir: DirId) -> Result<Vec<PendingFile>> {
        let mut batch = Vec::new();
        for entry in sorted_entries(src)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let sp = entry.path();
            let mp = mounted.join(&name);
            let md = fs::metadata(&sp)?;
            if md.is_dir() {
                let existing = self.meta.lock().unwrap().child_dir(dir, &name);
                match existing {
                    Some(child) => batch.extend(self.check_tree(&mp, &sp, child)?),
                    None => {
                        let child = self.meta.lock().unwrap().add_dir(dir, &name);
                        batch.extend(self.collect_tree(child, &sp)?);
                    }
                }
            } else {
                let size = md.len();
                let existing = self.meta.lock().unwrap().child_file(dir, &name);
                let (id, changed) = match existing {
                    None => {
                        let id = {
                            let mut meta = self.meta.lock().unwrap();
                            let id = meta.add_file(dir, &name);
                            meta.files[id as usize].size = size;
                            id
                        };
                        (id, true)
                    }
                    Some(id) => {
                        // Hash the stored side through the mount, in parallel
                        // with the source side.
                        let chunk = self.limits.max_block;
                        let (src_digest, stored_digest) = rayon::join(
                            || hash::sha512_file(&sp, chunk),
                            || hash::sha512_file(&mp, chunk),
                        );
                        let changed = src_digest? != stored_digest?;
                        if changed {
                            self.meta.lock().unwrap().files[id as usize].size = size;
                        }
                        (id, changed)
                    }
                };
                if changed {
                    info!(file = %sp.display(), "content differs, re-ingesting");
                    if size >= self.limits.min_block {
                        self.add_large_file(id, size, &sp, true)?;
                    } else {
                        batch.push(PendingFile { id, size, path: sp });
                    }
                }
            }
        }
        Ok(batch)
    }
}
