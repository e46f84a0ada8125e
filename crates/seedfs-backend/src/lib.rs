//! # seedfs-backend
//!
//! Remote storage facade for seedfs.
//!
//! The facade owns a pool of authenticated object-store handles, one per
//! persisted token, and hands blocks to them for upload and download. Callers
//! never see a remote failure: every remote operation retries with a one
//! second backoff until it succeeds. The slot lock is never held across I/O.
//!
//! Remote layout: up to two nested random directories under a fixed root,
//! memoized in a persisted directory map, with a random-prefixed object name.
//! The returned handle is `"<object_id>|<d1>/<d2>/<prefix>"`.

mod dir_store;

pub use dir_store::DirStore;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

/// Errors from a single object-store operation.
///
/// These never leave the facade's public upload/download entry points; they
/// exist so store implementations can report failures to the retry loop.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("state encode error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One authenticated handle to the remote object store.
///
/// Implementations are external collaborators; the facade only needs these
/// three operations. `parent` and the returned ids are opaque store-side
/// identifiers.
pub trait ObjectStore: Send + Sync {
    /// Create a directory under `parent` and return its id.
    fn create_dir(&self, name: &str, parent: &str) -> Result<String>;

    /// Upload `src` under `parent` as `name` and return the object id.
    fn upload_file(&self, name: &str, src: &Path, parent: &str) -> Result<String>;

    /// Download the object into `dest`.
    fn download_file(&self, object_id: &str, dest: &Path) -> Result<()>;
}

/// Builds an [`ObjectStore`] from one persisted token.
pub type Connector = Box<dyn Fn(&str) -> Result<Arc<dyn ObjectStore>> + Send + Sync>;

struct Pool {
    stores: Vec<Arc<dyn ObjectStore>>,
    used: Vec<bool>,
}

/// The pooled upload/download facade.
pub struct Backend {
    pool: Mutex<Pool>,
    slot_freed: Condvar,
    dir_map: Mutex<HashMap<String, String>>,
    remote_root: String,
    tokens_file: PathBuf,
    dirmap_file: PathBuf,
    connect: Connector,
}

impl Backend {
    pub fn new(
        tokens_file: PathBuf,
        dirmap_file: PathBuf,
        remote_root: String,
        connect: Connector,
    ) -> Self {
        Self {
            pool: Mutex::new(Pool {
                stores: Vec::new(),
                used: Vec::new(),
            }),
            slot_freed: Condvar::new(),
            dir_map: Mutex::new(HashMap::new()),
            remote_root,
            tokens_file,
            dirmap_file,
            connect,
        }
    }

    /// (Re)load tokens and the directory map from disk and rebuild the pool.
    pub fn load(&self) -> Result<()> {
        let tokens = read_state::<Vec<String>>(&self.tokens_file)?.unwrap_or_default();
        let mut stores = Vec::with_capacity(tokens.len());
        for tok in &tokens {
            stores.push((self.connect)(tok)?);
        }
        let dir_map = read_state::<HashMap<String, String>>(&self.dirmap_file)?.unwrap_or_default();

        let n = stores.len();
        {
            let mut pool = self.pool.lock().unwrap();
            pool.used = vec![false; n];
            pool.stores = stores;
        }
        *self.dir_map.lock().unwrap() = dir_map;
        if n == 0 {
            warn!("backend loaded with no tokens, uploads and downloads will stall");
        } else {
            info!(handles = n, "backend loaded");
        }
        Ok(())
    }

    /// Persist the directory map.
    pub fn save(&self) -> Result<()> {
        write_state(&self.dirmap_file, &*self.dir_map.lock().unwrap())?;
        debug!("backend state saved");
        Ok(())
    }

    /// Append a token to the persisted list. Takes effect on the next
    /// [`Backend::load`].
    pub fn add_token(&self, token: &str) -> Result<()> {
        let mut tokens = read_state::<Vec<String>>(&self.tokens_file)?.unwrap_or_default();
        tokens.push(token.to_string());
        write_state(&self.tokens_file, &tokens)?;
        info!(total = tokens.len(), "token added");
        Ok(())
    }

    /// Number of pooled handles.
    pub fn handle_count(&self) -> usize {
        self.pool.lock().unwrap().stores.len()
    }

    /// Upload `src` for logical block `logical_id`, delete the local file,
    /// and return the remote handle. Retries remote failures forever.
    pub fn move_file(&self, src: &Path, logical_id: u64) -> String {
        let (slot, store) = self.acquire_slot();
        let handle = self.upload_with(&*store, src, logical_id);
        self.release_slot(slot);
        if let Err(e) = fs::remove_file(src) {
            warn!(src = %src.display(), error = %e, "failed to remove staged block");
        }
        handle
    }

    /// Fetch the object behind `source` into `dest`. An empty `source` means
    /// the block has not finished uploading anywhere yet; the caller gets a
    /// zero-filled stand-in of `expected_size` bytes instead.
    pub fn cache_file(&self, source: &str, dest: &Path, expected_size: u64) {
        let (slot, store) = self.acquire_slot();
        if source.is_empty() {
            debug!(dest = %dest.display(), size = expected_size, "caching zero-filled stand-in");
            if let Err(e) = zero_fill(dest, expected_size) {
                warn!(dest = %dest.display(), error = %e, "failed to create stand-in file");
            }
            self.release_slot(slot);
            return;
        }
        let object_id = source.split('|').next().unwrap_or(source);
        loop {
            match store.download_file(object_id, dest) {
                Ok(()) => break,
                Err(e) => {
                    warn!(object = object_id, error = %e, "download failed, retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        self.release_slot(slot);
    }

    /// Block until no pooled handle is in use.
    pub fn wait_all(&self) {
        let mut pool = self.pool.lock().unwrap();
        while pool.used.iter().any(|&u| u) {
            pool = self.slot_freed.wait(pool).unwrap();
        }
    }

    fn acquire_slot(&self) -> (usize, Arc<dyn ObjectStore>) {
        let mut pool = self.pool.lock().unwrap();
        loop {
            let free: Vec<usize> = (0..pool.used.len()).filter(|&i| !pool.used[i]).collect();
            if let Some(&slot) = free.choose(&mut rand::thread_rng()) {
                pool.used[slot] = true;
                return (slot, pool.stores[slot].clone());
            }
            pool = self.slot_freed.wait(pool).unwrap();
        }
    }

    fn release_slot(&self, slot: usize) {
        let mut pool = self.pool.lock().unwrap();
        pool.used[slot] = false;
        drop(pool);
        self.slot_freed.notify_all();
    }

    /// Resolve (creating and memoizing as needed) the two nested remote
    /// directories, then upload under a random-prefixed name.
    fn upload_with(&self, store: &dyn ObjectStore, src: &Path, logical_id: u64) -> String {
        let d1 = format!("{:02x}", rand::thread_rng().gen_range(0..256));
        let d2 = format!("{:02x}", rand::thread_rng().gen_range(0..256));

        let parent = {
            let mut map = self.dir_map.lock().unwrap();
            let top = match map.get(&d1) {
                Some(id) => id.clone(),
                None => {
                    let id = retry(|| store.create_dir(&d1, &self.remote_root));
                    map.insert(d1.clone(), id.clone());
                    id
                }
            };
            let key = format!("{d1}/{d2}");
            match map.get(&key) {
                Some(id) => id.clone(),
                None => {
                    let id = retry(|| store.create_dir(&d2, &top));
                    map.insert(key, id.clone());
                    id
                }
            }
        };

        let prefix = format!("{:06x}", rand::thread_rng().gen_range(0..0x1000000));
        let name = format!("{prefix}_{logical_id}");
        debug!(block = logical_id, dir = %format!("{d1}/{d2}"), "uploading block");
        let object_id = retry(|| store.upload_file(&name, src, &parent));
        info!(block = logical_id, object = %object_id, "upload complete");
        format!("{object_id}|{d1}/{d2}/{prefix}")
    }
}

/// Retry a remote operation forever with a one second backoff.
fn retry<T>(mut op: impl FnMut() -> Result<T>) -> T {
    loop {
        match op() {
            Ok(v) => return v,
            Err(e) => {
                warn!(error = %e, "remote operation failed, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn zero_fill(dest: &Path, size: u64) -> io::Result<()> {
    let f = fs::File::create(dest)?;
    f.set_len(size)
}

fn read_state<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(bincode::deserialize(&data)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_state<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, bincode::serialize(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_backend(dir: &Path, handles: usize) -> Backend {
        let backend = Backend::new(
            dir.join("tokens"),
            dir.join("dirmap"),
            String::new(),
            Box::new(|tok| Ok(Arc::new(DirStore::open(Path::new(tok))?) as Arc<dyn ObjectStore>)),
        );
        let remote = dir.join("remote");
        fs::create_dir_all(&remote).unwrap();
        for _ in 0..handles {
            backend.add_token(remote.to_str().unwrap()).unwrap();
        }
        backend.load().unwrap();
        backend
    }

    #[test]
    fn test_move_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path(), 1);

        let staged = dir.path().join("7");
        fs::write(&staged, b"block seven").unwrap();
        let handle = backend.move_file(&staged, 7);

        assert!(!staged.exists(), "staged file is deleted after upload");
        let (object_id, remote_path) = handle.split_once('|').unwrap();
        assert!(object_id.ends_with("_7"));
        assert_eq!(remote_path.split('/').count(), 3);

        let dest = dir.path().join("fetched");
        backend.cache_file(&handle, &dest, 11);
        assert_eq!(fs::read(&dest).unwrap(), b"block seven");
    }

    #[test]
    fn test_cache_file_empty_source_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path(), 1);

        let dest = dir.path().join("standin");
        backend.cache_file("", &dest, 64);
        assert_eq!(fs::read(&dest).unwrap(), vec![0u8; 64]);
        // The slot must be free again.
        backend.wait_all();
    }

    #[test]
    fn test_dir_map_is_memoized_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path(), 1);

        for i in 0..20u64 {
            let staged = dir.path().join(i.to_string());
            fs::write(&staged, b"x").unwrap();
            backend.move_file(&staged, i);
        }
        backend.save().unwrap();

        let map = read_state::<HashMap<String, String>>(&dir.path().join("dirmap"))
            .unwrap()
            .unwrap();
        assert!(!map.is_empty());
        // Every nested key has its top-level parent memoized too.
        for key in map.keys() {
            if let Some((d1, _)) = key.split_once('/') {
                assert!(map.contains_key(d1));
            }
        }
    }

    /// Counting store used to observe pool behavior.
    struct CountingStore {
        inner: DirStore,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ObjectStore for CountingStore {
        fn create_dir(&self, name: &str, parent: &str) -> Result<String> {
            self.inner.create_dir(name, parent)
        }

        fn upload_file(&self, name: &str, src: &Path, parent: &str) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            let out = self.inner.upload_file(name, src, parent);
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }

        fn download_file(&self, object_id: &str, dest: &Path) -> Result<()> {
            self.inner.download_file(object_id, dest)
        }
    }

    #[test]
    fn test_pool_bounds_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        fs::create_dir_all(&remote).unwrap();
        let store = Arc::new(CountingStore {
            inner: DirStore::open(&remote).unwrap(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let store_for_connect = store.clone();
        let backend = Arc::new(Backend::new(
            dir.path().join("tokens"),
            dir.path().join("dirmap"),
            String::new(),
            Box::new(move |_| Ok(store_for_connect.clone() as Arc<dyn ObjectStore>)),
        ));
        backend.add_token("a").unwrap();
        backend.add_token("b").unwrap();
        backend.load().unwrap();

        let mut workers = Vec::new();
        for i in 0..8u64 {
            let backend = backend.clone();
            let staged = dir.path().join(format!("blk{i}"));
            fs::write(&staged, b"payload").unwrap();
            workers.push(std::thread::spawn(move || {
                backend.move_file(&staged, i);
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        backend.wait_all();

        assert!(store.peak.load(Ordering::SeqCst) <= 2, "two slots, two uploads at most");
        assert_eq!(store.active.load(Ordering::SeqCst), 0);
    }

    /// Store whose first upload attempt fails, to exercise the retry loop.
    struct FlakyStore {
        inner: DirStore,
        failures_left: AtomicUsize,
    }

    impl ObjectStore for FlakyStore {
        fn create_dir(&self, name: &str, parent: &str) -> Result<String> {
            self.inner.create_dir(name, parent)
        }

        fn upload_file(&self, name: &str, src: &Path, parent: &str) -> Result<String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Remote("transient".into()));
            }
            self.inner.upload_file(name, src, parent)
        }

        fn download_file(&self, object_id: &str, dest: &Path) -> Result<()> {
            self.inner.download_file(object_id, dest)
        }
    }

    #[test]
    fn test_upload_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        fs::create_dir_all(&remote).unwrap();
        let store = Arc::new(FlakyStore {
            inner: DirStore::open(&remote).unwrap(),
            failures_left: AtomicUsize::new(1),
        });

        let store_for_connect = store.clone();
        let backend = Backend::new(
            dir.path().join("tokens"),
            dir.path().join("dirmap"),
            String::new(),
            Box::new(move |_| Ok(store_for_connect.clone() as Arc<dyn ObjectStore>)),
        );
        backend.add_token("a").unwrap();
        backend.load().unwrap();

        let staged = dir.path().join("blk");
        fs::write(&staged, b"payload").unwrap();
        let handle = backend.move_file(&staged, 0);
        assert!(handle.contains('|'));
    }
}
