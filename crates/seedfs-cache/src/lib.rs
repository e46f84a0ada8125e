//! # seedfs-cache
//!
//! Bounded LRU block cache backed by the local cache directory.
//!
//! Blocks are cached as whole files named by block id. Admission is a single
//! flag per block, so concurrent readers of the same block trigger at most
//! one download; the download itself runs on a background thread and readers
//! wait on a condvar until it lands. Open readers pin a block: pinned blocks
//! are never evicted, even if that leaves the cache over its limit for a
//! while.
//!
//! Lock order is fixed everywhere: metadata lock first, cache state second.

mod reader;

pub use reader::BlockReader;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use seedfs_backend::Backend;
use seedfs_meta::{BlockId, FsMeta};

/// Per-block cache bookkeeping, all parallel arrays indexed by block id.
#[derive(Default)]
struct CacheState {
    /// The block has been admitted and a download scheduled.
    cached: Vec<bool>,
    /// The download finished; the local file is readable.
    really_cached: Vec<bool>,
    /// Readers currently holding the block open. Non-zero pins the block.
    open_count: Vec<u64>,
    /// Monotonic milliseconds of the last touch.
    last_access: Vec<u64>,
    /// Ids currently admitted, in no particular order.
    cached_list: Vec<BlockId>,
    /// Sum of admitted block sizes.
    total_size: u64,
}

pub struct BlockCache {
    meta: Arc<Mutex<FsMeta>>,
    backend: Arc<Backend>,
    dir: PathBuf,
    limit: u64,
    state: Mutex<CacheState>,
    downloaded: Condvar,
    epoch: Instant,
}

impl BlockCache {
    pub fn new(
        meta: Arc<Mutex<FsMeta>>,
        backend: Arc<Backend>,
        dir: &Path,
        limit: u64,
    ) -> io::Result<Arc<Self>> {
        fs::create_dir_all(dir)?;
        let cache = Arc::new(Self {
            meta,
            backend,
            dir: dir.to_path_buf(),
            limit,
            state: Mutex::new(CacheState::default()),
            downloaded: Condvar::new(),
            epoch: Instant::now(),
        });
        cache.sync_len();
        Ok(cache)
    }

    /// Shared metadata handle, for composing readers and adapters.
    pub fn metadata(&self) -> Arc<Mutex<FsMeta>> {
        self.meta.clone()
    }

    fn block_path(&self, id: BlockId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Resize the per-block arrays to the current block count, keeping
    /// existing entries. Call after every metadata (re)load.
    pub fn sync_len(&self) {
        let meta = self.meta.lock().unwrap();
        let n = meta.blocks.len();
        let mut st = self.state.lock().unwrap();
        st.cached.resize(n, false);
        st.really_cached.resize(n, false);
        st.open_count.resize(n, 0);
        st.last_access.resize(n, 0);
    }

    /// Admit `id` into the cache, evicting cold unpinned blocks first, and
    /// refresh its access time. Must hold both locks, metadata first.
    ///
    /// Eviction stops once every remaining entry is pinned, so the cache can
    /// exceed its limit while readers hold blocks open; it also runs before
    /// the new block is accounted, so the total can overshoot by one block
    /// until the next admission.
    fn touch_locked(self: &Arc<Self>, meta: &FsMeta, st: &mut CacheState, id: BlockId) {
        if !st.cached[id as usize] {
            while st.total_size > self.limit {
                let mut oldest = u64::MAX;
                let mut pos = None;
                for (i, &bid) in st.cached_list.iter().enumerate() {
                    if st.open_count[bid as usize] == 0 && st.last_access[bid as usize] < oldest {
                        oldest = st.last_access[bid as usize];
                        pos = Some(i);
                    }
                }
                let Some(pos) = pos else { break };
                let rid = st.cached_list.swap_remove(pos);
                st.cached[rid as usize] = false;
                st.really_cached[rid as usize] = false;
                if let Err(e) = fs::remove_file(self.block_path(rid)) {
                    warn!(block = rid, error = %e, "failed to remove evicted block");
                }
                st.total_size -= meta.blocks[rid as usize].size;
                debug!(block = rid, total = st.total_size, "evicted block");
            }
            st.cached[id as usize] = true;
            st.cached_list.push(id);
            st.total_size += meta.blocks[id as usize].size;
            debug!(block = id, total = st.total_size, "admitted block");
            self.spawn_download(id);
        }
        st.last_access[id as usize] = self.now_ms();
    }

    /// Fetch the block into the cache directory on a background thread, then
    /// flip `really_cached` and wake waiters.
    fn spawn_download(self: &Arc<Self>, id: BlockId) {
        let cache = self.clone();
        std::thread::spawn(move || {
            let (source, size) = {
                let meta = cache.meta.lock().unwrap();
                let b = &meta.blocks[id as usize];
                (b.source.clone(), b.size)
            };
            cache.backend.cache_file(&source, &cache.block_path(id), size);
            let mut st = cache.state.lock().unwrap();
            st.really_cached[id as usize] = true;
            drop(st);
            cache.downloaded.notify_all();
        });
    }

    /// Schedule `id` without opening or waiting for it.
    pub fn prefetch(self: &Arc<Self>, id: BlockId) {
        let meta = self.meta.lock().unwrap();
        let mut st = self.state.lock().unwrap();
        self.touch_locked(&meta, &mut st, id);
    }

    /// Admit and pin `id`, wait until its download completes, and open the
    /// local cache file.
    pub fn open(self: &Arc<Self>, id: BlockId) -> io::Result<fs::File> {
        {
            let meta = self.meta.lock().unwrap();
            let mut st = self.state.lock().unwrap();
            self.touch_locked(&meta, &mut st, id);
            st.open_count[id as usize] += 1;
            drop(meta);
            while !st.really_cached[id as usize] {
                st = self.downloaded.wait(st).unwrap();
            }
        }
        match fs::File::open(self.block_path(id)) {
            Ok(f) => Ok(f),
            Err(e) => {
                self.state.lock().unwrap().open_count[id as usize] -= 1;
                Err(e)
            }
        }
    }

    /// Release a pin taken by [`BlockCache::open`].
    pub fn close(&self, id: BlockId, file: fs::File) {
        drop(file);
        self.state.lock().unwrap().open_count[id as usize] -= 1;
    }

    // Introspection helpers.

    pub fn is_cached(&self, id: BlockId) -> bool {
        self.state.lock().unwrap().cached[id as usize]
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().unwrap().total_size
    }

    pub fn open_count(&self, id: BlockId) -> u64 {
        self.state.lock().unwrap().open_count[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use seedfs_backend::{DirStore, ObjectStore};
    use seedfs_meta::Block;

    struct Env {
        _dir: tempfile::TempDir,
        meta: Arc<Mutex<FsMeta>>,
        backend: Arc<Backend>,
        root: PathBuf,
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

    /// Create a block with the given payload, uploaded through the backend.
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
        fs::write(&staged, payload).unwrap();
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

    fn read_all(mut f: fs::File) -> Vec<u8> {
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_open_reads_block_contents() {
        let env = setup();
        let id = add_block(&env, b"hello block");
        let cache = make_cache(&env, 1 << 20);

        let f = cache.open(id).unwrap();
        let data = read_all(f.try_clone().unwrap());
        assert_eq!(data, b"hello block");
        cache.close(id, f);
        assert_eq!(cache.open_count(id), 0);
    }

    #[test]
    fn test_empty_source_reads_zero_fill() {
        let env = setup();
        let id = {
            let mut meta = env.meta.lock().unwrap();
            meta.blocks.push(Block {
                size: 16,
                source: String::new(),
            });
            (meta.blocks.len() - 1) as BlockId
        };
        let cache = make_cache(&env, 1 << 20);

        let f = cache.open(id).unwrap();
        assert_eq!(read_all(f.try_clone().unwrap()), vec![0u8; 16]);
        cache.close(id, f);
    }

    #[test]
    fn test_lru_evicts_coldest_unpinned() {
        let env = setup();
        let b0 = add_block(&env, &[0u8; 8]);
        let b1 = add_block(&env, &[1u8; 8]);
        let b2 = add_block(&env, &[2u8; 8]);
        let cache = make_cache(&env, 10);

        let f = cache.open(b0).unwrap();
        cache.close(b0, f);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let f = cache.open(b1).unwrap();
        cache.close(b1, f);
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Admitting b2 pushes the total over the limit; b0 is coldest.
        let f = cache.open(b2).unwrap();
        cache.close(b2, f);

        assert!(!cache.is_cached(b0));
        assert!(cache.is_cached(b1));
        assert!(cache.is_cached(b2));
        assert!(!env.root.join("cache").join(b0.to_string()).exists());
        assert!(cache.total_size() <= 10 + 8);
    }

    #[test]
    fn test_pinned_block_survives_eviction_pressure() {
        let env = setup();
        let b0 = add_block(&env, &[0u8; 8]);
        let b1 = add_block(&env, &[1u8; 8]);
        let cache = make_cache(&env, 0);

        let pinned = cache.open(b0).unwrap();
        // Zero limit forces eviction on every admission; b0 is pinned.
        let f = cache.open(b1).unwrap();
        cache.close(b1, f);
        assert!(cache.is_cached(b0));
        assert!(env.root.join("cache").join(b0.to_string()).exists());

        cache.close(b0, pinned);
        // Unpinned now; the next admission can claim it.
        let b2 = add_block(&env, &[2u8; 8]);
        cache.sync_len();
        let f = cache.open(b2).unwrap();
        cache.close(b2, f);
        assert!(!cache.is_cached(b0));
    }

    /// Store wrapper that counts downloads.
    struct CountingStore {
        inner: DirStore,
        downloads: Arc<AtomicUsize>,
    }

    impl ObjectStore for CountingStore {
        fn create_dir(&self, name: &str, parent: &str) -> seedfs_backend::Result<String> {
            self.inner.create_dir(name, parent)
        }

        fn upload_file(
            &self,
            name: &str,
            src: &Path,
            parent: &str,
        ) -> seedfs_backend::Result<String> {
            self.inner.upload_file(name, src, parent)
        }

        fn download_file(&self, object_id: &str, dest: &Path) -> seedfs_backend::Result<()> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.inner.download_file(object_id, dest)
        }
    }

    #[test]
    fn test_concurrent_opens_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let downloads = Arc::new(AtomicUsize::new(0));
        let downloads_for_connect = downloads.clone();
        let backend = Arc::new(Backend::new(
            root.join("tokens"),
            root.join("dirmap"),
            String::new(),
            Box::new(move |tok| {
                Ok(Arc::new(CountingStore {
                    inner: DirStore::open(Path::new(tok))?,
                    downloads: downloads_for_connect.clone(),
                }) as Arc<dyn ObjectStore>)
            }),
        ));
        backend
            .add_token(root.join("remote").to_str().unwrap())
            .unwrap();
        backend.load().unwrap();

        let env = Env {
            _dir: dir,
            meta: Arc::new(Mutex::new(FsMeta::new())),
            backend,
            root,
        };
        let id = add_block(&env, b"shared");
        let cache = make_cache(&env, 1 << 20);

        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            readers.push(std::thread::spawn(move || {
                let f = cache.open(id).unwrap();
                let data = read_all(f.try_clone().unwrap());
                cache.close(id, f);
                data
            }));
        }
        for r in readers {
            assert_eq!(r.join().unwrap(), b"shared");
        }
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_len_preserves_state() {
        let env = setup();
        let b0 = add_block(&env, &[0u8; 4]);
        let cache = make_cache(&env, 1 << 20);
        let f = cache.open(b0).unwrap();
        cache.close(b0, f);

        add_block(&env, &[1u8; 4]);
        cache.sync_len();
        assert!(cache.is_cached(b0));
        assert!(!cache.is_cached(1));
    }
}
