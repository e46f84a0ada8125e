//! # seedfs-meta
//!
//! Persistent filesystem metadata for seedfs.
//!
//! The whole graph is dense arrays indexed by id: directories, files and
//! blocks. A file's bytes live either inside one block at an offset (packed)
//! or span an ordered run of blocks end-to-end (split). Name maps, the inode
//! index and the content-hash dedup index are derived state, rebuilt from the
//! ordered arrays on every load.
//!
//! Persistence is a varint-coded binary file (see [`varint`]); the layout is
//! fixed and decoding is strict, trailing bytes are an error.

pub mod varint;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use varint::{put_string, put_uvarint, Reader};

/// Errors that can occur on the metadata graph.
#[derive(thiserror::Error, Debug)]
pub enum MetaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, MetaError>;

pub type DirId = u64;
pub type FileId = u64;
pub type BlockId = u64;

/// Sentinel for "no id".
pub const NULL_ID: u64 = u64::MAX;

/// Whole-file SHA-512 digest.
pub type Sha512Digest = [u8; 64];

/// Where a file's bytes live.
///
/// `Split` holds a non-empty run of blocks; a single-chunk file degrades to
/// `Packed` at offset 0. This keeps the two forms mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    Packed { block: BlockId, offset: u64 },
    Split(Vec<BlockId>),
}

impl Default for Storage {
    fn default() -> Self {
        Storage::Packed {
            block: 0,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dir {
    pub name: String,
    pub inode: u64,
    pub children: Vec<DirId>,
    pub files: Vec<FileId>,
    pub child_by_name: HashMap<String, DirId>,
    pub file_by_name: HashMap<String, FileId>,
}

#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub inode: u64,
    pub size: u64,
    pub sha512: Sha512Digest,
    pub storage: Storage,
}

impl Default for File {
    fn default() -> Self {
        Self {
            name: String::new(),
            inode: 0,
            size: 0,
            sha512: [0u8; 64],
            storage: Storage::default(),
        }
    }
}

/// A contiguous byte run stored as one remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub size: u64,
    /// Remote handle; empty until the upload worker writes it, then never
    /// changed again.
    pub source: String,
}

/// Either side of the namespace, for inode-based dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryId {
    Dir(DirId),
    File(FileId),
}

/// Result of resolving a `/`-separated path against the directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLookup {
    /// Every segment resolved to a directory.
    Found(DirId),
    /// A segment did not exist.
    Missing,
    /// A segment resolved to a file.
    NotDir,
}

/// The filesystem metadata graph.
#[derive(Debug, Default)]
pub struct FsMeta {
    pub dirs: Vec<Dir>,
    pub files: Vec<File>,
    pub blocks: Vec<Block>,
    /// Last inode value handed out.
    pub next_inode: u64,
    /// Content hash to owning file, for ingest-time deduplication.
    pub sha512_index: HashMap<Sha512Digest, FileId>,
    /// Inode number to entry, for the FUSE adapter.
    pub by_inode: HashMap<u64, EntryId>,
}

impl FsMeta {
    /// Empty graph: just the root directory `/` with inode 1.
    pub fn new() -> Self {
        let mut meta = Self {
            dirs: vec![Dir {
                name: "/".to_string(),
                inode: 1,
                ..Dir::default()
            }],
            files: Vec::new(),
            blocks: Vec::new(),
            next_inode: 1,
            sha512_index: HashMap::new(),
            by_inode: HashMap::new(),
        };
        meta.by_inode.insert(1, EntryId::Dir(0));
        meta
    }

    // === Namespace operations ===

    pub fn child_dir(&self, dir: DirId, name: &str) -> Option<DirId> {
        self.dirs[dir as usize].child_by_name.get(name).copied()
    }

    pub fn child_file(&self, dir: DirId, name: &str) -> Option<FileId> {
        self.dirs[dir as usize].file_by_name.get(name).copied()
    }

    /// Append an empty directory under `parent` and assign the next inode.
    pub fn add_dir(&mut self, parent: DirId, name: &str) -> DirId {
        let id = self.dirs.len() as DirId;
        self.next_inode += 1;
        let inode = self.next_inode;
        self.dirs.push(Dir {
            name: name.to_string(),
            inode,
            ..Dir::default()
        });
        self.dirs[parent as usize].children.push(id);
        self.dirs[parent as usize]
            .child_by_name
            .insert(name.to_string(), id);
        self.by_inode.insert(inode, EntryId::Dir(id));
        id
    }

    /// Append an empty file record under `parent` and assign the next inode.
    pub fn add_file(&mut self, parent: DirId, name: &str) -> FileId {
        let id = self.files.len() as FileId;
        self.next_inode += 1;
        let inode = self.next_inode;
        self.files.push(File {
            name: name.to_string(),
            inode,
            ..File::default()
        });
        self.dirs[parent as usize].files.push(id);
        self.dirs[parent as usize]
            .file_by_name
            .insert(name.to_string(), id);
        self.by_inode.insert(inode, EntryId::File(id));
        id
    }

    /// Resolve a path of the form `/a/b/c` (no trailing slash) to a
    /// directory id, descending from the root.
    pub fn lookup_path(&self, path: &str) -> PathLookup {
        let mut cur: DirId = 0;
        for seg in path.split('/').skip(1) {
            if self.child_file(cur, seg).is_some() {
                return PathLookup::NotDir;
            }
            match self.child_dir(cur, seg) {
                Some(next) => cur = next,
                None => return PathLookup::Missing,
            }
        }
        PathLookup::Found(cur)
    }

    /// Resolve a path whose final segment names a file.
    pub fn resolve_file(&self, path: &str) -> Option<FileId> {
        let segs: Vec<&str> = path.split('/').skip(1).collect();
        let mut cur: DirId = 0;
        for (i, seg) in segs.iter().enumerate() {
            if let Some(f) = self.child_file(cur, seg) {
                return if i == segs.len() - 1 { Some(f) } else { None };
            }
            cur = self.child_dir(cur, seg)?;
        }
        None
    }

    /// Create any missing directory segments of `path` and return the final
    /// directory id.
    pub fn ensure_dir_path(&mut self, path: &str) -> DirId {
        let mut cur: DirId = 0;
        let segs: Vec<String> = path.split('/').skip(1).map(str::to_string).collect();
        for seg in segs {
            cur = match self.child_dir(cur, &seg) {
                Some(next) => next,
                None => self.add_dir(cur, &seg),
            };
        }
        cur
    }

    // === Dedup index ===

    /// If another file with the same content hash is already indexed, adopt
    /// its storage and inode and report true.
    pub fn link_duplicate(&mut self, id: FileId) -> bool {
        if let Some(&other) = self.sha512_index.get(&self.files[id as usize].sha512) {
            let storage = self.files[other as usize].storage.clone();
            let inode = self.files[other as usize].inode;
            self.files[id as usize].storage = storage;
            self.files[id as usize].inode = inode;
            return true;
        }
        false
    }

    /// Count, per block, how many file records reference it.
    pub fn block_ref_counts(&self) -> Vec<u64> {
        let mut refs = vec![0u64; self.blocks.len()];
        for f in &self.files {
            match &f.storage {
                Storage::Packed { block, .. } => {
                    if (*block as usize) < refs.len() {
                        refs[*block as usize] += 1;
                    }
                }
                Storage::Split(ids) => {
                    for b in ids {
                        if (*b as usize) < refs.len() {
                            refs[*b as usize] += 1;
                        }
                    }
                }
            }
        }
        refs
    }

    // === Persistence ===

    /// Serialize the graph. Layout: dirs, files, blocks, next_inode; each
    /// section prefixed by its count.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, self.dirs.len() as u64);
        for d in &self.dirs {
            put_string(&mut buf, &d.name);
            put_uvarint(&mut buf, d.inode);
            put_uvarint(&mut buf, d.children.len() as u64);
            for c in &d.children {
                put_uvarint(&mut buf, *c);
            }
            put_uvarint(&mut buf, d.files.len() as u64);
            for f in &d.files {
                put_uvarint(&mut buf, *f);
            }
        }
        put_uvarint(&mut buf, self.files.len() as u64);
        for f in &self.files {
            let (block, offset, split): (u64, u64, &[BlockId]) = match &f.storage {
                Storage::Packed { block, offset } => (*block, *offset, &[]),
                Storage::Split(ids) => (0, 0, ids),
            };
            put_string(&mut buf, &f.name);
            put_uvarint(&mut buf, f.inode);
            put_uvarint(&mut buf, f.size);
            put_uvarint(&mut buf, block);
            put_uvarint(&mut buf, offset);
            buf.extend_from_slice(&f.sha512);
            put_uvarint(&mut buf, split.len() as u64);
            for b in split {
                put_uvarint(&mut buf, *b);
            }
        }
        put_uvarint(&mut buf, self.blocks.len() as u64);
        for b in &self.blocks {
            put_uvarint(&mut buf, b.size);
            put_string(&mut buf, &b.source);
        }
        put_uvarint(&mut buf, self.next_inode);
        buf
    }

    /// Strict inverse of [`encode`]; rebuilds all derived maps.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut meta = FsMeta::default();

        let ndirs = r.uvarint()?;
        for _ in 0..ndirs {
            let mut d = Dir {
                name: r.string()?,
                inode: r.uvarint()?,
                ..Dir::default()
            };
            let nchild = r.uvarint()?;
            for _ in 0..nchild {
                d.children.push(r.uvarint()?);
            }
            let nfiles = r.uvarint()?;
            for _ in 0..nfiles {
                d.files.push(r.uvarint()?);
            }
            meta.dirs.push(d);
        }

        let nfiles = r.uvarint()?;
        for _ in 0..nfiles {
            let name = r.string()?;
            let inode = r.uvarint()?;
            let size = r.uvarint()?;
            let block = r.uvarint()?;
            let offset = r.uvarint()?;
            let mut sha512 = [0u8; 64];
            sha512.copy_from_slice(r.bytes(64)?);
            let nsplit = r.uvarint()?;
            let mut split = Vec::with_capacity(nsplit as usize);
            for _ in 0..nsplit {
                split.push(r.uvarint()?);
            }
            let storage = if split.is_empty() {
                Storage::Packed { block, offset }
            } else {
                Storage::Split(split)
            };
            meta.files.push(File {
                name,
                inode,
                size,
                sha512,
                storage,
            });
        }

        let nblocks = r.uvarint()?;
        for _ in 0..nblocks {
            meta.blocks.push(Block {
                size: r.uvarint()?,
                source: r.string()?,
            });
        }

        meta.next_inode = r.uvarint()?;
        if !r.is_empty() {
            return Err(MetaError::Decode("trailing bytes".into()));
        }
        meta.rebuild();
        Ok(meta)
    }

    /// Rebuild name maps, the inode index and the hash index from the
    /// ordered arrays.
    fn rebuild(&mut self) {
        for i in 0..self.dirs.len() {
            let children = self.dirs[i].children.clone();
            let files = self.dirs[i].files.clone();
            self.dirs[i].child_by_name = children
                .iter()
                .map(|&c| (self.dirs[c as usize].name.clone(), c))
                .collect();
            self.dirs[i].file_by_name = files
                .iter()
                .map(|&f| (self.files[f as usize].name.clone(), f))
                .collect();
        }
        self.sha512_index = self
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.sha512, i as FileId))
            .collect();
        self.by_inode.clear();
        for (i, d) in self.dirs.iter().enumerate() {
            self.by_inode.insert(d.inode, EntryId::Dir(i as DirId));
        }
        for (i, f) in self.files.iter().enumerate() {
            self.by_inode.insert(f.inode, EntryId::File(i as FileId));
        }
    }

    /// Atomically rewrite the metadata file: write a sibling temp file, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), dirs = self.dirs.len(), files = self.files.len(),
               blocks = self.blocks.len(), "metadata saved");
        Ok(())
    }

    /// Load the metadata file; a missing file yields the empty root graph.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => Self::decode(&data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no metadata file, starting empty");
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
