//! Background whole-object prefetch
//!
//! Streams an object front to back on the bridge and fills the cache as
//! chunks arrive. Demand reads never depend on it: a failed or abandoned
//! prefetch leaves the remaining blocks fetchable as usual.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bridge::AsyncBridge;
use crate::coordinator::BlockCache;
use crate::error::{CacheError, Result};
use crate::source::{BoundObject, ByteStream, ObjectStore};

enum State {
    Ready(u64),
    Pending(oneshot::Receiver<Result<u64>>),
}

/// Outcome of a prefetch: bytes streamed into the cache
///
/// Dropping the handle does not stop the prefetch.
pub struct PrefetchHandle {
    state: State,
}

impl PrefetchHandle {
    /// A handle for a prefetch that had nothing to do
    pub fn ready(bytes: u64) -> Self {
        Self {
            state: State::Ready(bytes),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<u64>>) -> Self {
        Self {
            state: State::Pending(rx),
        }
    }

    /// Whether a background task is behind this handle
    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// Block until the prefetch finishes
    pub fn wait(self) -> Result<u64> {
        match self.state {
            State::Ready(bytes) => Ok(bytes),
            State::Pending(rx) => {
                if Handle::try_current().is_ok() {
                    return Err(CacheError::NestedRuntime);
                }
                rx.blocking_recv().map_err(|_| CacheError::BridgeClosed)?
            }
        }
    }

    /// Await the prefetch from async code
    pub async fn join(self) -> Result<u64> {
        match self.state {
            State::Ready(bytes) => Ok(bytes),
            State::Pending(rx) => rx.await.map_err(|_| CacheError::BridgeClosed)?,
        }
    }
}

/// Start filling `cache` from a sequential stream of its object
///
/// Returns a ready handle when the object is local or a previous prefetch
/// already completed it.
///
/// # Arguments
/// * `bridge` - Scheduler the stream runs on
/// * `cache` - Cache to fill
/// * `chunk_size` - Bytes accumulated before each fill
pub fn prefetch<S: ObjectStore>(
    bridge: &AsyncBridge,
    cache: Arc<BlockCache<BoundObject<S>>>,
    chunk_size: usize,
) -> PrefetchHandle {
    let object = cache.fetcher();
    if object.store().is_local(object.id()) {
        debug!(source = object.id(), "Object is local, skipping prefetch");
        return PrefetchHandle::ready(0);
    }
    if cache.is_complete() {
        debug!(source = object.id(), "Object already prefetched");
        return PrefetchHandle::ready(0);
    }

    let (tx, rx) = oneshot::channel();
    bridge.spawn(async move {
        let outcome = stream_into(&cache, chunk_size).await;
        let source = &cache.descriptor().source_id;
        match &outcome {
            Ok(bytes) => info!(source = %source, bytes = bytes, "Prefetch complete"),
            Err(e) => warn!(source = %source, error = %e, "Prefetch failed"),
        }
        // The caller may have dropped the handle
        let _ = tx.send(outcome);
    });
    PrefetchHandle::pending(rx)
}

async fn stream_into<S: ObjectStore>(
    cache: &BlockCache<BoundObject<S>>,
    chunk_size: usize,
) -> Result<u64> {
    let object = cache.fetcher();
    let mut stream = object
        .store()
        .open_stream(object.id())
        .await
        .map_err(CacheError::Fetch)?;

    // Fills stop at block boundaries so that every block ends up published
    let block_size = usize::try_from(cache.block_size()).unwrap_or(usize::MAX);
    let mut offset = 0u64;
    let mut pending = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.map_err(CacheError::Fetch)? {
        pending.extend_from_slice(&chunk);
        if pending.len() < chunk_size {
            continue;
        }
        let aligned = pending.len() - pending.len() % block_size;
        if aligned > 0 {
            cache.fill(offset, &pending[..aligned]);
            offset += aligned as u64;
            pending.drain(..aligned);
        }
    }
    if !pending.is_empty() {
        cache.fill(offset, &pending);
        offset += pending.len() as u64;
    }

    if offset < cache.total_size() {
        return Err(CacheError::ShortFetch {
            start: 0,
            end: cache.total_size(),
            actual: offset as usize,
        });
    }
    cache.mark_complete();
    Ok(offset)
}
