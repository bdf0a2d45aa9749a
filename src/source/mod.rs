//! Fetch capabilities consumed by the cache
//!
//! The cache never talks to storage directly. A surrounding layer hands it an
//! [`ObjectStore`] that resolves object ids; [`BoundObject`] pins one id so the
//! coordinator only deals in `(start, end)` byte ranges.

pub mod errors;
pub mod http;
pub mod local;

use std::future::Future;
use std::sync::Arc;

pub use errors::HttpError;
pub use http::HttpStore;
pub use local::LocalStore;

/// Blocking range fetch
pub trait RangeFetcher: Send + Sync + 'static {
    /// Bytes `[start, end)` of the object
    fn fetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>>;
}

/// Awaitable range fetch
pub trait AsyncRangeFetcher: Send + Sync + 'static {
    /// Bytes `[start, end)` of the object
    fn afetch(
        &self,
        start: u64,
        end: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

/// Sequential reader over a whole object
pub trait ByteStream: Send + 'static {
    /// Next chunk of the object, or `None` at the end
    fn next_chunk(&mut self) -> impl Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send;
}

/// Storage layer that resolves object ids to data
pub trait ObjectStore: Send + Sync + 'static {
    type Stream: ByteStream;

    fn fetch(&self, id: &str, start: u64, end: u64) -> anyhow::Result<Vec<u8>>;

    fn afetch(
        &self,
        id: &str,
        start: u64,
        end: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;

    /// Whether the object is already on local disk and needs no prefetch
    fn is_local(&self, id: &str) -> bool;

    fn open_stream(&self, id: &str) -> impl Future<Output = anyhow::Result<Self::Stream>> + Send;

    /// Total object size in bytes
    fn size(&self, id: &str) -> impl Future<Output = anyhow::Result<u64>> + Send;
}

/// One object of a store, usable as a range capability
pub struct BoundObject<S> {
    store: Arc<S>,
    id: String,
}

impl<S> BoundObject<S> {
    pub fn new(store: Arc<S>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: ObjectStore> RangeFetcher for BoundObject<S> {
    fn fetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.store.fetch(&self.id, start, end)
    }
}

impl<S: ObjectStore> AsyncRangeFetcher for BoundObject<S> {
    async fn afetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.store.afetch(&self.id, start, end).await
    }
}
