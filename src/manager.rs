//! Per-object cache handles
//!
//! Maps source ids to open [`BlockCache`]s under one cache directory. Open
//! handles are kept in a bounded moka cache; evicting one only unmaps it, the
//! files on disk stay.
//!
//! The store and the open handles are bound to the current process and are
//! rebuilt after a fork, since a store may hold connections or runtime state.

use std::ops::Range;
use std::sync::Arc;

use moka::sync::Cache;
use tracing::debug;

use crate::bridge;
use crate::config::CacheConfig;
use crate::coordinator::{BlockCache, CacheDescriptor, WaitPolicy};
use crate::error::{CacheError, Result};
use crate::path_mapper::{PathMapper, SeparatorMapper};
use crate::prefetch::{self, PrefetchHandle};
use crate::process_local::ProcessLocal;
use crate::source::{BoundObject, ObjectStore};
use crate::store::FilePaths;

/// Block cache over one object of store `S`
pub type ObjectCache<S> = BlockCache<BoundObject<S>>;

type StoreFactory<S> = Arc<dyn Fn() -> anyhow::Result<Arc<S>> + Send + Sync>;

/// On-disk progress of one cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub blocks: usize,
    pub done: usize,
    /// A prefetch streamed the whole object
    pub complete: bool,
}

struct Binding<S> {
    store: Arc<S>,
    caches: Cache<String, Arc<ObjectCache<S>>>,
}

/// Entry point for reading objects through the cache
pub struct CacheManager<S> {
    config: CacheConfig,
    mapper: Arc<dyn PathMapper>,
    factory: StoreFactory<S>,
    binding: ProcessLocal<Arc<Binding<S>>>,
}

impl<S: ObjectStore> CacheManager<S> {
    /// Create a manager
    ///
    /// # Arguments
    /// * `config` - Cache settings, validated here
    /// * `factory` - Builds the store; called again in each forked child
    pub fn new<F>(config: CacheConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> anyhow::Result<Arc<S>> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            mapper: Arc::new(SeparatorMapper),
            factory: Arc::new(factory),
            binding: ProcessLocal::new(),
        })
    }

    /// Use `mapper` for cache file names instead of the separator mapper
    pub fn with_mapper(mut self, mapper: impl PathMapper + 'static) -> Self {
        self.mapper = Arc::new(mapper);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn binding(&self) -> Result<Arc<Binding<S>>> {
        self.binding.try_get(|| {
            let store = (self.factory)().map_err(CacheError::Fetch)?;
            let caches = Cache::builder()
                .max_capacity(self.config.max_open_caches)
                .build();
            Ok(Arc::new(Binding { store, caches }))
        })
    }

    /// The store for this process
    pub fn store(&self) -> Result<Arc<S>> {
        Ok(Arc::clone(&self.binding()?.store))
    }

    /// Cache file locations for `id`
    pub fn paths(&self, id: &str) -> FilePaths {
        FilePaths::new(&self.config.cache_dir, &self.mapper.map(id))
    }

    /// Open the cache for `id`, creating its files on first use
    pub fn open(&self, id: &str, total_size: u64) -> Result<Arc<ObjectCache<S>>> {
        let binding = self.binding()?;
        if let Some(cache) = binding.caches.get(id) {
            if cache.total_size() == total_size {
                return Ok(cache);
            }
            debug!(
                source = id,
                old_size = cache.total_size(),
                new_size = total_size,
                "Object size changed, reopening cache"
            );
        }

        let descriptor = CacheDescriptor {
            source_id: id.to_string(),
            total_size,
            block_size: self.config.block_size,
        };
        let object = Arc::new(BoundObject::new(Arc::clone(&binding.store), id));
        let cache = Arc::new(BlockCache::open(
            descriptor,
            &self.paths(id),
            object,
            WaitPolicy::from(&self.config),
        )?);
        binding.caches.insert(id.to_string(), Arc::clone(&cache));
        debug!(source = id, total_size = total_size, "Opened block cache");
        Ok(cache)
    }

    /// Bytes `[start, end)` of `id`, fetching on the calling thread
    pub fn read(&self, id: &str, total_size: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        self.open(id, total_size)?.read(start, end)
    }

    /// Bytes `[start, end)` of `id` from async code
    pub async fn aread(&self, id: &str, total_size: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        let cache = self.open(id, total_size)?;
        cache.aread(start, end).await
    }

    /// Several ranges of `id` at once, read concurrently on the bridge
    pub fn read_many(&self, id: &str, total_size: u64, ranges: Vec<Range<u64>>) -> Result<Vec<Vec<u8>>> {
        let cache = self.open(id, total_size)?;
        bridge::global()?.fetch_many(cache, ranges)
    }

    /// Stream all of `id` into the cache in the background
    pub fn prefetch(&self, id: &str, total_size: u64) -> Result<PrefetchHandle> {
        let cache = self.open(id, total_size)?;
        let bridge = bridge::global()?;
        Ok(prefetch::prefetch(&bridge, cache, self.config.prefetch_chunk_size))
    }

    /// Object size as reported by the store
    pub fn size(&self, id: &str) -> Result<u64> {
        let store = self.store()?;
        let id = id.to_string();
        bridge::global()?.run(async move { store.size(&id).await.map_err(CacheError::Fetch) })
    }

    /// Block progress of `id` as recorded on disk
    pub fn status(&self, id: &str, total_size: u64) -> Result<CacheStatus> {
        let cache = self.open(id, total_size)?;
        let files = cache.files();
        Ok(CacheStatus {
            blocks: files.blocks(),
            done: files.index().map_or(0, |index| index.done_count()),
            complete: cache.is_complete(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_mapper::HashMapper;
    use crate::testing::{patterned, MemoryStore};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOTAL: u64 = 10_000;

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            block_size: 1024,
            prefetch_chunk_size: 4096,
            ..CacheConfig::with_cache_dir(dir)
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_object("dir/a.bin", patterned(TOTAL as usize))
                .with_object("b.bin", vec![7u8; 3000]),
        )
    }

    fn manager(dir: &Path, store: &Arc<MemoryStore>) -> CacheManager<MemoryStore> {
        let store = Arc::clone(store);
        CacheManager::new(config(dir), move || Ok(Arc::clone(&store))).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let bad = CacheConfig {
            block_size: 0,
            ..config(dir.path())
        };
        let result = CacheManager::new(bad, move || Ok(Arc::clone(&store)));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_open_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &store());

        let a = manager.open("dir/a.bin", TOTAL).unwrap();
        let b = manager.open("dir/a.bin", TOTAL).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let resized = manager.open("dir/a.bin", TOTAL / 2).unwrap();
        assert!(!Arc::ptr_eq(&a, &resized));
        assert_eq!(resized.total_size(), TOTAL / 2);
    }

    #[test]
    fn test_old_handle_survives_resize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new().with_object("big", patterned(100_000)));
        let manager = manager(dir.path(), &store);

        let old = manager.open("big", 100_000).unwrap();
        old.read(0, 100_000).unwrap();

        let resized = manager.open("big", 5_000).unwrap();
        assert_eq!(resized.read(0, 5_000).unwrap(), patterned(100_000)[..5_000]);

        // Still served from the old files, without a new fetch
        let calls = store.object("big").calls();
        assert_eq!(old.read(50_000, 60_000).unwrap(), patterned(100_000)[50_000..60_000]);
        assert_eq!(store.object("big").calls(), calls);
    }

    #[test]
    fn test_files_use_mapped_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &store());
        manager.read("dir/a.bin", TOTAL, 0, 10).unwrap();
        assert!(dir.path().join("dir_@_a.bin.data").exists());
        assert!(dir.path().join("dir_@_a.bin.index").exists());

        let hashed = manager.with_mapper(HashMapper);
        let paths = hashed.paths("dir/a.bin");
        assert_eq!(paths.data.file_name().unwrap().len(), 40 + ".data".len());
    }

    #[test]
    fn test_second_manager_shares_fetched_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let first = manager(dir.path(), &store);
        let second = manager(dir.path(), &store);

        let bytes = first.read("dir/a.bin", TOTAL, 100, 5000).unwrap();
        assert_eq!(bytes, patterned(TOTAL as usize)[100..5000]);
        assert_eq!(second.read("dir/a.bin", TOTAL, 100, 5000).unwrap(), bytes);
        assert_eq!(store.object("dir/a.bin").calls(), 1);
    }

    #[test]
    fn test_read_many_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let manager = manager(dir.path(), &store);

        let results = manager
            .read_many("b.bin", 3000, vec![2000..2010, 0..5, 1500..1600])
            .unwrap();
        assert_eq!(results[0], vec![7u8; 10]);
        assert_eq!(results[1], vec![7u8; 5]);
        assert_eq!(results[2], vec![7u8; 100]);
    }

    #[test]
    fn test_prefetch_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let manager = manager(dir.path(), &store);

        let before = manager.status("dir/a.bin", TOTAL).unwrap();
        assert_eq!(before, CacheStatus { blocks: 10, done: 0, complete: false });

        manager.prefetch("dir/a.bin", TOTAL).unwrap().wait().unwrap();
        let after = manager.status("dir/a.bin", TOTAL).unwrap();
        assert_eq!(after, CacheStatus { blocks: 10, done: 10, complete: true });

        manager.read("dir/a.bin", TOTAL, 0, TOTAL).unwrap();
        assert_eq!(store.object("dir/a.bin").calls(), 0);
    }

    #[test]
    fn test_size_comes_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &store());
        assert_eq!(manager.size("b.bin").unwrap(), 3000);
        assert!(manager.size("missing").is_err());
    }

    #[test]
    fn test_store_is_built_once_per_process() {
        let dir = tempfile::tempdir().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let store = store();
        let manager = CacheManager::new(config(dir.path()), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&store))
        })
        .unwrap();

        manager.read("b.bin", 3000, 0, 10).unwrap();
        manager.read("dir/a.bin", TOTAL, 0, 10).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aread() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let manager = manager(dir.path(), &store);

        let bytes = manager.aread("dir/a.bin", TOTAL, 9000, 20_000).await.unwrap();
        assert_eq!(bytes, patterned(TOTAL as usize)[9000..]);
        assert_eq!(store.object("dir/a.bin").ranges(), vec![8192..TOTAL]);
    }
}
