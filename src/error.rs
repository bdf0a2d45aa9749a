//! Cache Error Types
//!
//! Structured error handling for block cache operations.
//! Fetch failures from the injected capability pass through unmodified.

use std::path::PathBuf;

/// Block cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failure reported by the fetch capability, surfaced as-is
    #[error(transparent)]
    Fetch(anyhow::Error),

    #[error("Source returned {actual} bytes for range {start}..{end}")]
    ShortFetch { start: u64, end: u64, actual: usize },

    #[error("Cache file error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start background scheduler: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Background scheduler is unavailable")]
    BridgeClosed,

    #[error("Cannot block on the background scheduler from inside an async runtime")]
    NestedRuntime,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    /// Attach a file path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error came from the underlying source rather than the cache itself
    pub fn is_fetch(&self) -> bool {
        matches!(self, CacheError::Fetch(_) | CacheError::ShortFetch { .. })
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
