//! # seedfs-fuse
//!
//! Read-only FUSE adapter over the seedfs metadata graph and block cache.
//!
//! - Inode numbers come straight from the metadata graph.
//! - Directories are mode 0555, files 0444; nothing is writable.
//! - `open` snapshots a file's block layout into a handle and prefetches its
//!   first block; `read` serves ranges through the cache.
//! - Looking up `__refresh__` under the root reloads metadata and backend
//!   state from disk, so an ingest in another process can publish its result
//!   to a live mount.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
        ReplyEmpty, ReplyEntry, ReplyOpen, Request,
    };
    use libc::ENOENT;
    use tracing::{info, warn};

    use seedfs_backend::Backend;
    use seedfs_cache::{BlockCache, BlockReader};
    use seedfs_meta::{EntryId, FsMeta};

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u64 = 4096;
    const REFRESH_NAME: &str = "__refresh__";
    const ROOT_INODE: u64 = 1;

    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_sig: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    pub struct SeedFs {
        meta: Arc<Mutex<FsMeta>>,
        cache: Arc<BlockCache>,
        backend: Arc<Backend>,
        metadata_file: PathBuf,
        handles: HashMap<u64, BlockReader>,
        next_fh: u64,
    }

    impl SeedFs {
        pub fn new(
            meta: Arc<Mutex<FsMeta>>,
            cache: Arc<BlockCache>,
            backend: Arc<Backend>,
            metadata_file: &Path,
        ) -> Self {
            Self {
                meta,
                cache,
                backend,
                metadata_file: metadata_file.to_path_buf(),
                handles: HashMap::new(),
                next_fh: 1,
            }
        }

        /// Mount at `mountpoint` and serve until SIGINT or SIGTERM.
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let options = [
                MountOption::RO,
                MountOption::FSName("seedfs".to_string()),
                MountOption::Subtype("seedfs".to_string()),
                MountOption::AllowOther,
            ];
            let session = fuser::spawn_mount2(self, mountpoint, &options)?;
            unsafe {
                libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
                libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
            }
            info!(mountpoint = %mountpoint.display(), "mounted");
            while !SHUTDOWN.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(session);
            info!("unmounted");
            Ok(())
        }

        /// Reload metadata and backend state from disk and resize the cache
        /// bookkeeping to the new block count.
        fn refresh(&self) {
            info!("reloading state through refresh lookup");
            match FsMeta::load(&self.metadata_file) {
                Ok(new_meta) => *self.meta.lock().unwrap() = new_meta,
                Err(e) => {
                    warn!(error = %e, "metadata reload failed, keeping current state");
                    return;
                }
            }
            if let Err(e) = self.backend.load() {
                warn!(error = %e, "backend reload failed");
            }
            self.cache.sync_len();
        }

        fn dir_attr(ino: u64) -> FileAttr {
            FileAttr {
                ino,
                size: 0,
                blocks: 0,
                atime: UNIX_EPOCH,
                mtime: UNIX_EPOCH,
                ctime: UNIX_EPOCH,
                crtime: UNIX_EPOCH,
                kind: FileType::Directory,
                perm: 0o555,
                nlink: 2,
                uid: 0,
                gid: 0,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE as u32,
            }
        }

        fn file_attr(ino: u64, size: u64) -> FileAttr {
            FileAttr {
                ino,
                size,
                blocks: size.div_ceil(BLOCK_SIZE),
                atime: UNIX_EPOCH,
                mtime: UNIX_EPOCH,
                ctime: UNIX_EPOCH,
                crtime: UNIX_EPOCH,
                kind: FileType::RegularFile,
                perm: 0o444,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE as u32,
            }
        }
    }

    impl Filesystem for SeedFs {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let name = match name.to_str() {
                Some(s) => s,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            if parent == ROOT_INODE && name == REFRESH_NAME {
                self.refresh();
            }

            let meta = self.meta.lock().unwrap();
            let dir = match meta.by_inode.get(&parent) {
                Some(EntryId::Dir(d)) => *d,
                _ => {
                    drop(meta);
                    reply.error(ENOENT);
                    return;
                }
            };
            if let Some(child) = meta.child_dir(dir, name) {
                let attr = Self::dir_attr(meta.dirs[child as usize].inode);
                drop(meta);
                reply.entry(&TTL, &attr, 0);
                return;
            }
            if let Some(child) = meta.child_file(dir, name) {
                let f = &meta.files[child as usize];
                let attr = Self::file_attr(f.inode, f.size);
                drop(meta);
                reply.entry(&TTL, &attr, 0);
                return;
            }
            drop(meta);
            reply.error(ENOENT);
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let meta = self.meta.lock().unwrap();
            match meta.by_inode.get(&ino) {
                Some(EntryId::Dir(_)) => reply.attr(&TTL, &Self::dir_attr(ino)),
                Some(EntryId::File(f)) => {
                    reply.attr(&TTL, &Self::file_attr(ino, meta.files[*f as usize].size))
                }
                None => reply.error(ENOENT),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let meta = self.meta.lock().unwrap();
            let dir = match meta.by_inode.get(&ino) {
                Some(EntryId::Dir(d)) => *d,
                _ => {
                    drop(meta);
                    reply.error(ENOENT);
                    return;
                }
            };

            if offset == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    reply.ok();
                    return;
                }
                if reply.add(ROOT_INODE, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }

            let d = &meta.dirs[dir as usize];
            let entries: Vec<(u64, FileType, String)> = d
                .children
                .iter()
                .map(|&c| {
                    let child = &meta.dirs[c as usize];
                    (child.inode, FileType::Directory, child.name.clone())
                })
                .chain(d.files.iter().map(|&f| {
                    let file = &meta.files[f as usize];
                    (file.inode, FileType::RegularFile, file.name.clone())
                }))
                .collect();
            drop(meta);

            let skip = if offset > 2 { (offset - 2) as usize } else { 0 };
            for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                if reply.add(child_ino, (i + 3) as i64, kind, &name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
            let file_id = {
                let meta = self.meta.lock().unwrap();
                match meta.by_inode.get(&ino) {
                    Some(EntryId::File(f)) => *f,
                    _ => {
                        drop(meta);
                        reply.error(ENOENT);
                        return;
                    }
                }
            };
            let reader = BlockReader::open(self.cache.clone(), file_id);
            let fh = self.next_fh;
            self.next_fh += 1;
            self.handles.insert(fh, reader);
            reply.opened(fh, 0);
        }

        fn read(
            &mut self,
            _req: &Request,
            ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let reader = match self.handles.get_mut(&fh) {
                Some(r) => r,
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            };
            let l = offset.max(0) as u64;
            match reader.read_range(l, l + u64::from(size)) {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    warn!(ino, offset, size, error = %e, "read failed");
                    reply.error(libc::EIO);
                }
            }
        }

        fn release(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            // Dropping the reader closes its open block and releases the pin.
            self.handles.remove(&fh);
            reply.ok();
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use seedfs_backend::Backend;
    use seedfs_cache::BlockCache;
    use seedfs_meta::FsMeta;

    /// Stub for non-Linux or non-fuse builds.
    pub struct SeedFs;

    impl SeedFs {
        pub fn new(
            _meta: Arc<Mutex<FsMeta>>,
            _cache: Arc<BlockCache>,
            _backend: Arc<Backend>,
            _metadata_file: &Path,
        ) -> Self {
            Self
        }

        pub fn mount(self, _mountpoint: &Path) -> anyhow::Result<()> {
            anyhow::bail!("FUSE support requires Linux and the `fuse` feature")
        }
    }
}

pub use imp::SeedFs;
