//! Persistent block cache for remote byte ranges
//!
//! Objects are cached as a pair of memory-mapped files: the data itself and a
//! one-byte-per-block state index. Threads, tasks and separate processes that
//! map the same pair cooperate through that index so each block is normally
//! fetched only once.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod path_mapper;
pub mod prefetch;
pub mod process_local;
pub mod source;
pub mod store;

#[cfg(test)]
mod testing;

pub use bridge::{AsyncBridge, BatchJob};
pub use config::CacheConfig;
pub use coordinator::{BlockCache, CacheDescriptor, CacheStats, FetchJob, WaitPolicy};
pub use error::{CacheError, Result};
pub use manager::{CacheManager, CacheStatus, ObjectCache};
pub use path_mapper::{HashMapper, PathMapper, SeparatorMapper};
pub use prefetch::PrefetchHandle;
pub use process_local::ProcessLocal;
pub use source::{
    AsyncRangeFetcher, BoundObject, ByteStream, HttpStore, LocalStore, ObjectStore, RangeFetcher,
};
pub use store::{BlockFiles, BlockIndex, BlockState, BlockStore, FilePaths};
