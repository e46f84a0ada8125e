//! Block assembly: packing small files, splitting large ones.

use std::fs;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info};

use seedfs_meta::{Block, BlockId, FileId, Storage};

use crate::{hash, Ingestor, PendingFile, Result};

impl Ingestor {
    /// Append an empty block record and return its id. The staged bytes and
    /// the upload are the caller's responsibility.
    pub(crate) fn reserve_block(&self, size: u64) -> BlockId {
        let mut meta = self.meta.lock().unwrap();
        let id = meta.blocks.len() as BlockId;
        meta.blocks.push(Block {
            size,
            source: String::new(),
        });
        id
    }

    /// Hand a staged block to an upload worker. The worker writes the remote
    /// handle back onto the block record; completion is observed through
    /// [`Ingestor::wait_uploads_settled`].
    pub(crate) fn spawn_upload(&self, id: BlockId) {
        let meta = self.meta.clone();
        let backend = self.backend.clone();
        let staged = self.stage_path(id);
        std::thread::spawn(move || {
            let source = backend.move_file(&staged, id);
            meta.lock().unwrap().blocks[id as usize].source = source;
        });
    }

    /// Split a large file (at or above `min_block`) into near-equal chunks of
    /// at most `max_block` bytes, one block each. A single-chunk file ends up
    /// packed at offset 0 instead.
    ///
    /// With `skip_link` unset, content already known to the hash index is
    /// adopted wholesale and no blocks are produced.
    pub fn add_large_file(&self, id: FileId, size: u64, path: &Path, skip_link: bool) -> Result<()> {
        info!(file = %path.display(), size, "splitting large file");
        let digest = hash::sha512_file(path, self.limits.max_block)?;
        {
            let mut meta = self.meta.lock().unwrap();
            meta.files[id as usize].sha512 = digest;
            if !skip_link && meta.link_duplicate(id) {
                debug!(file = %path.display(), "content already stored, linked");
                return Ok(());
            }
            meta.sha512_index.insert(digest, id);
        }

        let mut src = fs::File::open(path)?;
        let chunk_count = size.div_ceil(self.limits.max_block);
        let mut ids = Vec::with_capacity(chunk_count as usize);
        let mut pos = 0u64;
        for i in 0..chunk_count {
            // Equalize: each chunk takes its share of what remains.
            let chunk = (size - pos) / (chunk_count - i);
            let mut buf = vec![0u8; chunk as usize];
            src.read_exact(&mut buf)?;
            let block = self.reserve_block(chunk);
            fs::write(self.stage_path(block), &buf)?;
            self.spawn_upload(block);
            ids.push(block);
            pos += chunk;
            debug!(file = %path.display(), block, size = chunk, "chunk staged");
        }

        let storage = if ids.len() == 1 {
            Storage::Packed {
                block: ids[0],
                offset: 0,
            }
        } else {
            Storage::Split(ids)
        };
        self.meta.lock().unwrap().files[id as usize].storage = storage;
        Ok(())
    }

    /// Pack a batch of small files, size-ascending, into shared blocks.
    ///
    /// Each file is hashed and, unless `skip_link`, deduplicated against the
    /// index; survivors accumulate in a pending buffer that is flushed as one
    /// block whenever it reaches `min_block`, and once more at the end when
    /// `force` is set. Files still unflushed are returned to the caller.
    pub fn pack_small_files(
        &self,
        mut batch: Vec<PendingFile>,
        force: bool,
        skip_link: bool,
    ) -> Result<Vec<PendingFile>> {
        batch.sort_by_key(|f| f.size);
        if !batch.is_empty() {
            debug!(count = batch.len(), force, "packing small files");
        }

        let last = batch.len().wrapping_sub(1);
        let mut buf: Vec<u8> = Vec::new();
        let mut pending: Vec<PendingFile> = Vec::new();
        for (i, f) in batch.iter().enumerate() {
            let data = fs::read(&f.path)?;
            let digest = hash::sha512_bytes(&data);
            let duplicate = {
                let mut meta = self.meta.lock().unwrap();
                meta.files[f.id as usize].sha512 = digest;
                !skip_link && meta.link_duplicate(f.id)
            };
            if !duplicate {
                buf.extend_from_slice(&data);
                pending.push(f.clone());
            }
            if buf.len() as u64 >= self.limits.min_block
                || (i == last && force && !pending.is_empty())
            {
                self.flush_packed_block(&mut buf, &mut pending)?;
            }
        }
        Ok(pending)
    }

    /// Write the pending buffer as one block and record every pending file
    /// packed at its offset. Hashes enter the dedup index here, once the
    /// storage they would be linked to exists.
    fn flush_packed_block(
        &self,
        buf: &mut Vec<u8>,
        pending: &mut Vec<PendingFile>,
    ) -> Result<()> {
        let block = self.reserve_block(buf.len() as u64);
        fs::write(self.stage_path(block), &buf)?;
        {
            let mut meta = self.meta.lock().unwrap();
            let mut offset = 0u64;
            for p in pending.iter() {
                meta.files[p.id as usize].storage = Storage::Packed { block, offset };
                offset += p.size;
                let digest = meta.files[p.id as usize].sha512;
                meta.sha512_index.insert(digest, p.id);
            }
        }
        self.spawn_upload(block);
        info!(block, size = buf.len(), files = pending.len(), "packed block staged");
        buf.clear();
        pending.clear();
        Ok(())
    }
}
