//! Whole-file SHA-512.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha512};
use tracing::debug;

use seedfs_meta::Sha512Digest;

/// Hash an in-memory buffer. Used for small files that are read whole
/// anyway on their way into a packed block.
pub fn sha512_bytes(data: &[u8]) -> Sha512Digest {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Streamed hash of a file, reading `chunk` bytes at a time.
pub fn sha512_file(path: &Path, chunk: u64) -> io::Result<Sha512Digest> {
    let mut f = fs::File::open(path)?;
    let size = f.metadata()?.len();
    let total = size / chunk + 1;
    let mut buf = vec![0u8; chunk.min(size).max(1) as usize];
    let mut hasher = Sha512::new();
    let mut cur = 0u64;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        cur += 1;
        debug!(chunk = cur, total, path = %path.display(), "hash progress");
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}
