//! Range reads over a file's blocks.
//!
//! A reader snapshots the file's storage layout once, at open time, and then
//! serves arbitrary byte ranges by walking the involved blocks through the
//! cache. It keeps at most one block open at a time; on every block switch it
//! prefetches the next block of a split file so sequential reads stay ahead
//! of the network.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use seedfs_meta::{BlockId, FileId, Storage, NULL_ID};

use crate::BlockCache;

pub struct BlockReader {
    cache: Arc<BlockCache>,
    storage: Storage,
    size: u64,
    /// Sizes of the split blocks, positionally matching the storage list.
    block_sizes: Vec<u64>,
    /// Currently open block, `NULL_ID` if none.
    cur: BlockId,
    file: Option<fs::File>,
}

impl BlockReader {
    /// Snapshot `file_id`'s layout and schedule its first block.
    pub fn open(cache: Arc<BlockCache>, file_id: FileId) -> Self {
        let (storage, size, block_sizes, first) = {
            let meta = cache.metadata();
            let meta = meta.lock().unwrap();
            let f = &meta.files[file_id as usize];
            let storage = f.storage.clone();
            let (sizes, first) = match &storage {
                Storage::Split(ids) => (
                    ids.iter()
                        .map(|&b| meta.blocks[b as usize].size)
                        .collect::<Vec<_>>(),
                    ids[0],
                ),
                Storage::Packed { block, .. } => (Vec::new(), *block),
            };
            (storage, f.size, sizes, first)
        };
        cache.prefetch(first);
        Self {
            cache,
            storage,
            size,
            block_sizes,
            cur: NULL_ID,
            file: None,
        }
    }

    /// Read the clamped byte range `[l, r)` of the file.
    pub fn read_range(&mut self, l: u64, r: u64) -> io::Result<Vec<u8>> {
        let r = r.min(self.size);
        if l >= r {
            return Ok(Vec::new());
        }
        match self.storage.clone() {
            Storage::Packed { block, offset } => {
                let file = self.switch_block(block, None)?;
                file.seek(SeekFrom::Start(offset + l))?;
                let mut buf = vec![0u8; (r - l) as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
            Storage::Split(ids) => {
                let mut out = Vec::with_capacity((r - l) as usize);
                let mut block_start = 0u64;
                for (i, &bid) in ids.iter().enumerate() {
                    let block_end = block_start + self.block_sizes[i];
                    let tl = l.max(block_start);
                    let tr = r.min(block_end);
                    if tl < tr {
                        let file = self.switch_block(bid, ids.get(i + 1).copied())?;
                        file.seek(SeekFrom::Start(tl - block_start))?;
                        let mut buf = vec![0u8; (tr - tl) as usize];
                        file.read_exact(&mut buf)?;
                        out.extend_from_slice(&buf);
                    }
                    block_start = block_end;
                }
                Ok(out)
            }
        }
    }

    /// Make `id` the open block, closing the previous one, and prefetch the
    /// split successor if there is one.
    fn switch_block(&mut self, id: BlockId, next: Option<BlockId>) -> io::Result<&mut fs::File> {
        if self.cur != id {
            if self.cur != NULL_ID {
                if let Some(f) = self.file.take() {
                    self.cache.close(self.cur, f);
                }
            }
            self.file = Some(self.cache.open(id)?);
            self.cur = id;
            if let Some(n) = next {
                self.cache.prefetch(n);
            }
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no block open"))
    }

    /// Close the open block, releasing its cache pin.
    pub fn release(&mut self) {
        if self.cur != NULL_ID {
            if let Some(f) = self.file.take() {
                self.cache.close(self.cur, f);
            }
            self.cur = NULL_ID;
        }
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use seedfs_backend::{Backend, DirStore, ObjectStore};
    use seedfs_meta::{Block, FsMeta};

    struct Env {
        _dir: tempfile::TempDir,
        meta: Arc<std::sync::Mutex<FsMeta>>,
        backend: Arc<Backend>,
        root: std::path::PathBuf,
    }

    fn setup() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let backend = Arc::new(Backend::new(
            root.join("tokens"),
            root.join("dirmap"),
            String::new(),
            Box::new(|tok| {
                Ok(Arc::new(DirStore::open(Path::new(tok))?) as Arc<dyn ObjectStore>)
            }),
        ));
        backend
            .add_token(root.join("remote").to_str().unwrap())
            .unwrap();
        backend.load().unwrap();
        Env {
            _dir: dir,
            meta: Arc::new(Mutex::new(FsMeta::new())),
            backend,
            root,
        }
    }

    fn add_block(env: &Env, payload: &[u8]) -> BlockId {
        let id = {
            let mut meta = env.meta.lock().unwrap();
            let id = meta.blocks.len() as BlockId;
            meta.blocks.push(Block {
                size: payload.len() as u64,
                source: String::new(),
            });
            id
        };
        let staged = env.root.join(format!("staged-{id}"));
        std::fs::write(&staged, payload).unwrap();
        let source = env.backend.move_file(&staged, id);
        env.meta.lock().unwrap().blocks[id as usize].source = source;
        id
    }

    fn make_cache(env: &Env, limit: u64) -> Arc<BlockCache> {
        BlockCache::new(
            env.meta.clone(),
            env.backend.clone(),
            &env.root.join("cache"),
            limit,
        )
        .unwrap()
    }

    #[test]
    fn test_packed_read_at_offset() {
        let env = setup();
        let block = add_block(&env, b"aaaabbbbcccc");
        let file_id = {
            let mut meta = env.meta.lock().unwrap();
            let f = meta.add_file(0, "b.txt");
            meta.files[f as usize].size = 4;
            meta.files[f as usize].storage = Storage::Packed { block, offset: 4 };
            f
        };
        let cache = make_cache(&env, 1 << 20);

        let mut reader = BlockReader::open(cache.clone(), file_id);
        assert_eq!(reader.read_range(0, 4).unwrap(), b"bbbb");
        assert_eq!(reader.read_range(1, 3).unwrap(), b"bb");
        // Clamped at file size, not block size.
        assert_eq!(reader.read_range(2, 100).unwrap(), b"bb");
        assert!(reader.read_range(4, 8).unwrap().is_empty());
        reader.release();
        assert_eq!(cache.open_count(block), 0);
    }

    #[test]
    fn test_split_read_across_boundary() {
        let env = setup();
        let b0 = add_block(&env, &[b'x'; 64]);
        let b1 = add_block(&env, &[b'y'; 64]);
        let file_id = {
            let mut meta = env.meta.lock().unwrap();
            let f = meta.add_file(0, "split.bin");
            meta.files[f as usize].size = 128;
            meta.files[f as usize].storage = Storage::Split(vec![b0, b1]);
            f
        };
        let cache = make_cache(&env, 1 << 20);

        let mut reader = BlockReader::open(cache.clone(), file_id);
        let out = reader.read_range(64 - 16, 64 + 16).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..16], &[b'x'; 16]);
        assert_eq!(&out[16..], &[b'y'; 16]);
        drop(reader);
        assert_eq!(cache.open_count(b0), 0);
        assert_eq!(cache.open_count(b1), 0);
    }

    #[test]
    fn test_split_read_after_eviction_of_first_block() {
        let env = setup();
        let b0 = add_block(&env, &[b'x'; 64]);
        let b1 = add_block(&env, &[b'y'; 64]);
        let file_id = {
            let mut meta = env.meta.lock().unwrap();
            let f = meta.add_file(0, "split.bin");
            meta.files[f as usize].size = 128;
            meta.files[f as usize].storage = Storage::Split(vec![b0, b1]);
            f
        };
        // Limit of zero evicts everything not pinned on each admission.
        let cache = make_cache(&env, 0);

        let mut reader = BlockReader::open(cache.clone(), file_id);
        assert_eq!(reader.read_range(0, 8).unwrap(), &[b'x'; 8]);
        reader.release();

        // Force b0 out.
        let f = cache.open(b1).unwrap();
        cache.close(b1, f);
        assert!(!cache.is_cached(b0));

        // The cross-boundary read re-fetches b0 transparently.
        let out = reader.read_range(64 - 16, 64 + 16).unwrap();
        assert_eq!(&out[..16], &[b'x'; 16]);
        assert_eq!(&out[16..], &[b'y'; 16]);
    }

    #[test]
    fn test_switch_prefetches_next_split_block() {
        let env = setup();
        let b0 = add_block(&env, &[b'x'; 64]);
        let b1 = add_block(&env, &[b'y'; 64]);
        let file_id = {
            let mut meta = env.meta.lock().unwrap();
            let f = meta.add_file(0, "split.bin");
            meta.files[f as usize].size = 128;
            meta.files[f as usize].storage = Storage::Split(vec![b0, b1]);
            f
        };
        let cache = make_cache(&env, 1 << 20);

        let mut reader = BlockReader::open(cache.clone(), file_id);
        // A read confined to the first block still schedules the second.
        reader.read_range(0, 8).unwrap();
        assert!(cache.is_cached(b1));
    }
}
