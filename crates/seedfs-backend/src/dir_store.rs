//! Object store over a plain local directory.
//!
//! Used for development and tests, and for deployments where the "remote"
//! side is itself a mounted filesystem (NFS, rclone, sshfs). Object ids are
//! paths relative to the store root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{ObjectStore, Result};

pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn join_id(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl ObjectStore for DirStore {
    fn create_dir(&self, name: &str, parent: &str) -> Result<String> {
        let id = Self::join_id(parent, name);
        fs::create_dir_all(self.root.join(&id))?;
        Ok(id)
    }

    fn upload_file(&self, name: &str, src: &Path, parent: &str) -> Result<String> {
        let id = Self::join_id(parent, name);
        fs::copy(src, self.root.join(&id))?;
        Ok(id)
    }

    fn download_file(&self, object_id: &str, dest: &Path) -> Result<()> {
        fs::copy(self.root.join(object_id), dest)?;
        Ok(())
    }
}
