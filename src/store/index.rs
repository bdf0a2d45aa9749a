//! Memory-mapped block status index
//!
//! One byte per block plus a trailing sentinel slot that records whole-object
//! prefetch completion. The bytes are the only state shared between
//! cooperating processes in steady state.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapRaw;

use crate::error::{CacheError, Result};

/// Per-block fetch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Empty = 0,
    Claimed = 1,
    Done = 2,
}

impl BlockState {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => BlockState::Claimed,
            2 => BlockState::Done,
            // Anything unrecognised is refetched
            _ => BlockState::Empty,
        }
    }
}

/// Shared block status array
pub struct BlockIndex {
    map: MmapRaw,
    blocks: usize,
    path: PathBuf,
}

impl BlockIndex {
    /// Map an existing index file covering `blocks` blocks plus the sentinel
    pub(crate) fn open(path: &Path, blocks: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;
        let map = MmapRaw::map_raw(&file).map_err(|e| CacheError::io(path, e))?;
        if map.len() != blocks + 1 {
            return Err(CacheError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("index file is {} bytes, expected {}", map.len(), blocks + 1),
                ),
            ));
        }
        Ok(Self {
            map,
            blocks,
            path: path.to_path_buf(),
        })
    }

    fn slot(&self, i: usize) -> &AtomicU8 {
        assert!(i <= self.blocks, "block {} out of range", i);
        // SAFETY: `i` is inside the mapping, which lives as long as `self`.
        // AtomicU8 has the layout of u8, and every access to index bytes,
        // in this or any other process, goes through an atomic.
        unsafe { &*(self.map.as_ptr().add(i) as *const AtomicU8) }
    }

    /// Number of addressable blocks (the sentinel is not counted)
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn state(&self, i: usize) -> BlockState {
        debug_assert!(i < self.blocks);
        BlockState::from_byte(self.slot(i).load(Ordering::Acquire))
    }

    pub fn is_done(&self, i: usize) -> bool {
        self.state(i) == BlockState::Done
    }

    /// EMPTY -> CLAIMED; false if the block was not EMPTY
    pub fn try_claim(&self, i: usize) -> bool {
        debug_assert!(i < self.blocks);
        self.slot(i)
            .compare_exchange(
                BlockState::Empty as u8,
                BlockState::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish a block. Its bytes must already be in the data file.
    pub fn mark_done(&self, i: usize) {
        debug_assert!(i < self.blocks);
        self.slot(i).store(BlockState::Done as u8, Ordering::Release);
    }

    /// CLAIMED -> EMPTY; a block that reached DONE meanwhile is left alone
    pub fn reclaim(&self, i: usize) -> bool {
        debug_assert!(i < self.blocks);
        self.slot(i)
            .compare_exchange(
                BlockState::Claimed as u8,
                BlockState::Empty as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn done_count(&self) -> usize {
        (0..self.blocks).filter(|&i| self.is_done(i)).count()
    }

    /// Whether a background prefetch has streamed the whole object
    pub fn is_complete(&self) -> bool {
        self.slot(self.blocks).load(Ordering::Acquire) == BlockState::Done as u8
    }

    pub fn mark_complete(&self) {
        self.slot(self.blocks)
            .store(BlockState::Done as u8, Ordering::Release);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIndex")
            .field("path", &self.path)
            .field("blocks", &self.blocks)
            .finish()
    }
}
