//! Cache configuration
//!
//! Defaults, JSON file loading and environment overrides for the block cache.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Default block size: 4 MiB
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// How long to wait on another claimant before taking its blocks over
pub const DEFAULT_PARALLEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting on claimed blocks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default read size for background prefetch streams: 16 MiB
pub const DEFAULT_PREFETCH_CHUNK: usize = 16 * 1024 * 1024;

/// Default number of mapped caches kept open by the manager
pub const DEFAULT_MAX_OPEN_CACHES: u64 = 256;

/// Serialize a Duration as whole milliseconds.
///
/// Accepts either a number or a string containing a number when reading,
/// since hand-written config files tend to mix the two.
mod duration_ms {
    use serde::{de, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct MillisVisitor;

        impl<'de> de::Visitor<'de> for MillisVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("milliseconds as a u64 or a string containing a u64")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
                Ok(Duration::from_millis(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
                u64::try_from(value)
                    .map(Duration::from_millis)
                    .map_err(|_| de::Error::custom("negative duration"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                value
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(MillisVisitor)
    }
}

/// Block cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Directory holding the data/index file pairs
    pub cache_dir: PathBuf,
    /// Size of one claim/fetch unit in bytes
    pub block_size: u64,
    /// Wait on another claimant this long before reclaiming its blocks
    #[serde(with = "duration_ms")]
    pub parallel_timeout: Duration,
    /// Poll interval while waiting on claimed blocks
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Bytes accumulated from a prefetch stream before each fill
    pub prefetch_chunk_size: usize,
    /// Mapped caches kept open by the manager
    pub max_open_caches: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            block_size: DEFAULT_BLOCK_SIZE,
            parallel_timeout: DEFAULT_PARALLEL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            prefetch_chunk_size: DEFAULT_PREFETCH_CHUNK,
            max_open_caches: DEFAULT_MAX_OPEN_CACHES,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("blockcache")
}

impl CacheConfig {
    /// Create a config rooted at a specific cache directory
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BLOCKCACHE_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(dir) = env::var("BLOCKCACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var("BLOCKCACHE_BLOCK_SIZE") {
            self.block_size = value.trim().parse().map_err(|_| {
                CacheError::Config(format!("BLOCKCACHE_BLOCK_SIZE is not a number: {}", value))
            })?;
        }
        if let Ok(value) = env::var("BLOCKCACHE_TIMEOUT_MS") {
            let ms: u64 = value.trim().parse().map_err(|_| {
                CacheError::Config(format!("BLOCKCACHE_TIMEOUT_MS is not a number: {}", value))
            })?;
            self.parallel_timeout = Duration::from_millis(ms);
        }
        debug!(
            cache_dir = %self.cache_dir.display(),
            block_size = self.block_size,
            timeout_ms = self.parallel_timeout.as_millis() as u64,
            "Loaded cache configuration"
        );
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the cache cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CacheError::Config("block_size must be > 0".to_string()));
        }
        if self.prefetch_chunk_size == 0 {
            return Err(CacheError::Config(
                "prefetch_chunk_size must be > 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CacheError::Config("poll_interval must be > 0".to_string()));
        }
        Ok(())
    }
}
