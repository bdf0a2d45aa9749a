//! Source identifier to cache file name mapping
//!
//! Mappers must be deterministic: every process that maps the same source id
//! has to land on the same file pair.

use sha1::{Digest, Sha1};

/// Joiner substituted for path separators by [`SeparatorMapper`]
pub const SEPARATOR_JOINER: &str = "_@_";

/// Turns a source identifier into a flat cache key
pub trait PathMapper: Send + Sync {
    fn map(&self, source_id: &str) -> String;
}

/// Default mapper: keeps the id readable, replacing separators with a joiner
#[derive(Debug, Clone, Copy, Default)]
pub struct SeparatorMapper;

impl PathMapper for SeparatorMapper {
    fn map(&self, source_id: &str) -> String {
        source_id.replace(['/', '\\'], SEPARATOR_JOINER)
    }
}

/// Hex SHA-1 of the id; fixed length, for ids too long or odd for file names
#[derive(Debug, Clone, Copy, Default)]
pub struct HashMapper;

impl PathMapper for HashMapper {
    fn map(&self, source_id: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(source_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
