//! On-disk block storage
//!
//! Each cached object is a pair of sibling files in the cache directory: a
//! data file of exactly `total_size` bytes and an index file with one status
//! byte per block plus a sentinel. Existing pairs are reused as-is, which is
//! what lets a cache survive process restarts.

pub mod data;
pub mod index;
pub mod lock;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CacheError, Result};

pub use data::BlockStore;
pub use index::{BlockIndex, BlockState};
pub use lock::CreationLock;

const DATA_SUFFIX: &str = "data";
const INDEX_SUFFIX: &str = "index";
const LOCK_SUFFIX: &str = "lock";

/// Locations of one cached object's files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    pub data: PathBuf,
    pub index: PathBuf,
    pub lock: PathBuf,
}

impl FilePaths {
    /// Paths for cache key `key` inside `cache_dir`
    pub fn new(cache_dir: &Path, key: &str) -> Self {
        Self {
            data: cache_dir.join(format!("{}.{}", key, DATA_SUFFIX)),
            index: cache_dir.join(format!("{}.{}", key, INDEX_SUFFIX)),
            lock: cache_dir.join(format!("{}.{}", key, LOCK_SUFFIX)),
        }
    }
}

/// Number of blocks covering `total_size` bytes
pub fn block_count(total_size: u64, block_size: u64) -> u64 {
    total_size.div_ceil(block_size)
}

/// Data file and index mapped together
///
/// A zero-length object has no files and no mappings; reads return nothing.
#[derive(Debug)]
pub struct BlockFiles {
    total_size: u64,
    block_size: u64,
    mapped: Option<(BlockStore, BlockIndex)>,
}

impl BlockFiles {
    /// Open the pair at `paths`, creating it first if needed
    pub fn open(total_size: u64, block_size: u64, paths: &FilePaths) -> Result<Self> {
        if block_size == 0 {
            return Err(CacheError::Config("block_size must be > 0".to_string()));
        }
        if total_size == 0 {
            return Ok(Self {
                total_size,
                block_size,
                mapped: None,
            });
        }
        if usize::try_from(total_size).is_err() {
            return Err(CacheError::Config(format!(
                "object of {} bytes does not fit in the address space",
                total_size
            )));
        }
        let blocks = block_count(total_size, block_size) as usize;

        if !pair_ready(paths, total_size, blocks) {
            if let Some(parent) = paths.index.parent() {
                fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            let _lock = CreationLock::acquire(&paths.lock)?;
            // Another process may have finished while we waited
            if !pair_ready(paths, total_size, blocks) {
                create_pair(paths, total_size, blocks)?;
            }
        }

        let data = BlockStore::open(&paths.data, total_size)?;
        let index = BlockIndex::open(&paths.index, blocks)?;
        debug!(
            data = %paths.data.display(),
            total_size = total_size,
            blocks = blocks,
            "Mapped block cache files"
        );

        Ok(Self {
            total_size,
            block_size,
            mapped: Some((data, index)),
        })
    }

    /// Bytes `[start, end)`, clamped to the object
    pub fn read(&self, start: u64, end: u64) -> Vec<u8> {
        match &self.mapped {
            Some((data, _)) => data.read(start, end),
            None => Vec::new(),
        }
    }

    /// Raw write at `start`; does not touch the index
    pub fn write(&self, start: u64, bytes: &[u8]) {
        if let Some((data, _)) = &self.mapped {
            data.write(start, bytes);
        }
    }

    pub fn store(&self) -> Option<&BlockStore> {
        self.mapped.as_ref().map(|(data, _)| data)
    }

    pub fn index(&self) -> Option<&BlockIndex> {
        self.mapped.as_ref().map(|(_, index)| index)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn blocks(&self) -> usize {
        self.index().map_or(0, BlockIndex::blocks)
    }
}

fn pair_ready(paths: &FilePaths, total_size: u64, blocks: usize) -> bool {
    let data_ok = fs::metadata(&paths.data).is_ok_and(|m| m.len() == total_size);
    let index_ok = fs::metadata(&paths.index).is_ok_and(|m| m.len() == blocks as u64 + 1);
    data_ok && index_ok
}

/// Publish a fresh data file, then a fresh all-EMPTY index, each by rename.
///
/// Existing files are replaced, never resized: mappings of the old pair keep
/// their own inodes. The index appears last, so a present, correctly sized
/// index always has a correctly sized data file next to it.
fn create_pair(paths: &FilePaths, total_size: u64, blocks: usize) -> Result<()> {
    publish_sized(&paths.data, total_size)?;
    publish_sized(&paths.index, blocks as u64 + 1)?;

    info!(
        data = %paths.data.display(),
        total_size = total_size,
        blocks = blocks,
        "Created block cache files"
    );
    Ok(())
}

/// Create a zero-filled file of `len` bytes at `path` via temp file and rename
fn publish_sized(path: &Path, len: u64) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    tmp.as_file()
        .set_len(len)
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(1_000_000, 65_536), 16);
        assert_eq!(block_count(65_536, 65_536), 1);
        assert_eq!(block_count(65_537, 65_536), 2);
        assert_eq!(block_count(0, 65_536), 0);
    }

    #[test]
    fn test_zero_size_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "empty");

        let files = BlockFiles::open(0, 1024, &paths).unwrap();
        assert!(files.read(0, 0).is_empty());
        assert!(files.index().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");
        assert!(matches!(
            BlockFiles::open(10, 0, &paths),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_creates_sized_pair() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");

        let files = BlockFiles::open(1_000_000, 65_536, &paths).unwrap();
        assert_eq!(fs::metadata(&paths.data).unwrap().len(), 1_000_000);
        assert_eq!(fs::metadata(&paths.index).unwrap().len(), 17);
        assert_eq!(files.blocks(), 16);
    }

    #[test]
    fn test_reopen_reuses_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");

        {
            let files = BlockFiles::open(100, 10, &paths).unwrap();
            files.write(10, b"0123456789");
            files.index().unwrap().mark_done(1);
        }

        let files = BlockFiles::open(100, 10, &paths).unwrap();
        assert!(files.index().unwrap().is_done(1));
        assert_eq!(files.read(10, 20), b"0123456789");
    }

    #[test]
    fn test_stale_index_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");
        fs::write(&paths.index, [2u8; 3]).unwrap();

        let files = BlockFiles::open(100, 10, &paths).unwrap();
        assert_eq!(files.index().unwrap().done_count(), 0);
        assert_eq!(fs::metadata(&paths.index).unwrap().len(), 11);
    }

    #[test]
    fn test_resize_leaves_old_mapping_intact() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");

        let old = BlockFiles::open(100_000, 1000, &paths).unwrap();
        old.write(50_000, &[9u8; 10_000]);
        old.index().unwrap().mark_done(50);

        let resized = BlockFiles::open(5_000, 1000, &paths).unwrap();
        assert_eq!(fs::metadata(&paths.data).unwrap().len(), 5_000);
        assert_eq!(resized.index().unwrap().done_count(), 0);

        // The old pair is still mapped in full
        assert!(old.index().unwrap().is_done(50));
        assert_eq!(old.read(50_000, 60_000), vec![9u8; 10_000]);
    }

    #[test]
    fn test_concurrent_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FilePaths::new(dir.path(), "obj");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let paths = paths.clone();
                std::thread::spawn(move || BlockFiles::open(4096, 512, &paths).map(|f| f.blocks()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 8);
        }
    }
}
