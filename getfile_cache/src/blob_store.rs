//! A `BlobStore` backed by a directory of static files.
//!
//! `simplecached.c` delegates lookups to a `simplecache_get`/`simplecache_init`
//! pair that wasn't part of the retrieved source; this implements the same
//! path-to-file mapping directly against the filesystem.

use getfile::pipeline::BlobStore;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Maps a request path onto a file under `root`, rejecting any path
    /// that tries to climb out via `..` or an absolute component.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }
}

impl BlobStore for DirectoryBlobStore {
    type Handle = PathBuf;

    fn lookup(&self, path: &str) -> Option<Self::Handle> {
        let candidate = self.resolve(path)?;
        if candidate.is_file() {
            Some(candidate)
        } else {
            None
        }
    }

    fn size(&self, handle: &Self::Handle) -> u64 {
        std::fs::metadata(handle).map(|meta| meta.len()).unwrap_or(0)
    }

    fn read(&self, handle: &Self::Handle, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = File::open(handle)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let read = file.read(&mut buf[total..])?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("getfile_cache_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn lookup_rejects_parent_traversal() {
        let store = DirectoryBlobStore::new(tempdir());
        assert!(store.resolve("../../etc/passwd").is_none());
    }

    #[test]
    fn lookup_and_read_round_trip() {
        let root = tempdir();
        std::fs::write(root.join("hello.txt"), b"hello world").unwrap();
        let store = DirectoryBlobStore::new(root);

        let handle = store.lookup("hello.txt").expect("file should be found");
        assert_eq!(store.size(&handle), 11);

        let mut buf = vec![0u8; 5];
        let read = store.read(&handle, 6, &mut buf).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn lookup_missing_file_returns_none() {
        let store = DirectoryBlobStore::new(tempdir());
        assert!(store.lookup("does-not-exist.txt").is_none());
    }
}
