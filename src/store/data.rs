//! Memory-mapped data file holding the cached object's bytes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;

use memmap2::MmapRaw;

use crate::error::{CacheError, Result};

/// Fixed-size shared mapping of the cached object
///
/// The mapping is `MAP_SHARED`, so writes become visible to every thread and
/// process mapping the same file. Publication of written bytes is done by
/// the block index, never by this type.
pub struct BlockStore {
    map: MmapRaw,
    len: u64,
    path: PathBuf,
}

impl BlockStore {
    /// Map an existing data file of exactly `len` bytes
    pub(crate) fn open(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| CacheError::io(path, e))?;
        if map.len() as u64 != len {
            return Err(CacheError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("data file is {} bytes, expected {}", map.len(), len),
                ),
            ));
        }
        Ok(Self {
            map,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Copy bytes `[start, end)` out of the mapping, clamped to the file length
    pub fn read(&self, start: u64, end: u64) -> Vec<u8> {
        let end = end.min(self.len);
        if start >= end {
            return Vec::new();
        }
        let count = (end - start) as usize;
        let mut out = vec![0u8; count];
        // SAFETY: `start..end` lies inside the mapping. Concurrent writers only
        // ever store the same content for a given offset.
        unsafe {
            ptr::copy_nonoverlapping(
                self.map.as_ptr().add(start as usize),
                out.as_mut_ptr(),
                count,
            );
        }
        out
    }

    /// Copy `bytes` into the mapping at `start`; anything past the end is dropped
    pub fn write(&self, start: u64, bytes: &[u8]) {
        if start >= self.len {
            return;
        }
        let count = bytes.len().min((self.len - start) as usize);
        // SAFETY: the destination lies inside the mapping and cannot overlap
        // a caller-owned slice.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(start as usize),
                count,
            );
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized_file(dir: &Path, len: u64) -> PathBuf {
        let path = dir.join("object.data");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();
        path
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&sized_file(dir.path(), 32), 32).unwrap();

        store.write(4, b"hello");
        assert_eq!(store.read(4, 9), b"hello");
        assert_eq!(store.read(0, 4), vec![0u8; 4]);
    }

    #[test]
    fn test_write_past_end_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&sized_file(dir.path(), 8), 8).unwrap();

        store.write(6, b"abcd");
        assert_eq!(store.read(6, 100), b"ab");
        assert!(store.read(8, 10).is_empty());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = sized_file(dir.path(), 8);
        assert!(BlockStore::open(&path, 16).is_err());
    }

    #[test]
    fn test_writes_visible_through_second_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = sized_file(dir.path(), 16);
        let a = BlockStore::open(&path, 16).unwrap();
        let b = BlockStore::open(&path, 16).unwrap();

        a.write(0, b"shared");
        assert_eq!(b.read(0, 6), b"shared");
    }
}
