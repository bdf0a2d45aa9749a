//! Background scheduler bridge
//!
//! One dedicated thread per process runs a single-threaded tokio runtime.
//! Synchronous callers submit work to it and block until the whole submission
//! finishes, while the individual fetches interleave on that one thread.
//!
//! Failure of any fetch fails the whole submission. Sibling fetches already in
//! flight are detached rather than cancelled; their results are dropped.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::error::{CacheError, Result};
use crate::process_local::ProcessLocal;
use crate::source::AsyncRangeFetcher;

/// Name of the scheduler thread
const THREAD_NAME: &str = "blockcache-io";

/// Per-result transform applied on the scheduler before results are handed back
pub type Transform<T> = Arc<dyn Fn(Vec<u8>) -> T + Send + Sync>;

static GLOBAL: ProcessLocal<Arc<AsyncBridge>> = ProcessLocal::new();

/// The process-wide bridge, started on first use and rebuilt after a fork
pub fn global() -> Result<Arc<AsyncBridge>> {
    GLOBAL.try_get(|| AsyncBridge::start().map(Arc::new))
}

/// One capability with the ranges to fetch from it
pub struct BatchJob<F, T = Vec<u8>> {
    pub source: Arc<F>,
    pub ranges: Vec<Range<u64>>,
    pub transform: Transform<T>,
}

impl<F> BatchJob<F> {
    pub fn new(source: Arc<F>, ranges: Vec<Range<u64>>) -> Self {
        Self {
            source,
            ranges,
            transform: Arc::new(|bytes| bytes),
        }
    }
}

impl<F, T> BatchJob<F, T> {
    pub fn with_transform<M>(source: Arc<F>, ranges: Vec<Range<u64>>, transform: M) -> Self
    where
        M: Fn(Vec<u8>) -> T + Send + Sync + 'static,
    {
        Self {
            source,
            ranges,
            transform: Arc::new(transform),
        }
    }
}

/// Handle to the background scheduler thread
pub struct AsyncBridge {
    handle: Handle,
    /// Dropping this stops the scheduler
    _shutdown: oneshot::Sender<()>,
}

impl AsyncBridge {
    /// Start a scheduler on a new thread
    ///
    /// Most callers want [`global`] instead; separate bridges are useful in tests.
    pub fn start() -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                // Resolves when the sender is dropped
                let _ = runtime.block_on(shutdown_rx);
                debug!("Background scheduler stopped");
            })
            .map_err(CacheError::Spawn)?;

        let handle = ready_rx
            .recv()
            .map_err(|_| CacheError::BridgeClosed)?
            .map_err(CacheError::Spawn)?;

        info!(thread = THREAD_NAME, "Background scheduler started");
        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task without waiting for it
    pub fn spawn<Fut>(&self, future: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` on the scheduler and block the calling thread until it finishes
    pub fn run<Fut, T>(&self, future: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        // Blocking inside a runtime would stall it, or deadlock on our own thread
        if Handle::try_current().is_ok() {
            return Err(CacheError::NestedRuntime);
        }
        let task = self.handle.spawn(future);
        self.handle.block_on(task)?
    }

    /// Fetch one range
    pub fn fetch<F>(&self, source: Arc<F>, range: Range<u64>) -> Result<Vec<u8>>
    where
        F: AsyncRangeFetcher,
    {
        self.run(async move {
            source
                .afetch(range.start, range.end)
                .await
                .map_err(CacheError::Fetch)
        })
    }

    /// Fetch many ranges concurrently; results come back in input order
    pub fn fetch_many<F>(&self, source: Arc<F>, ranges: Vec<Range<u64>>) -> Result<Vec<Vec<u8>>>
    where
        F: AsyncRangeFetcher,
    {
        self.fetch_many_with(source, ranges, |bytes| bytes)
    }

    /// Fetch many ranges concurrently, transforming each result on the scheduler
    pub fn fetch_many_with<F, T, M>(
        &self,
        source: Arc<F>,
        ranges: Vec<Range<u64>>,
        transform: M,
    ) -> Result<Vec<T>>
    where
        F: AsyncRangeFetcher,
        T: Send + 'static,
        M: Fn(Vec<u8>) -> T + Send + Sync + 'static,
    {
        let transform: Transform<T> = Arc::new(transform);
        self.run(gather(source, ranges, transform))
    }

    /// Run several jobs at once, each parallelised internally
    pub fn fetch_jobs<F, T>(&self, jobs: Vec<BatchJob<F, T>>) -> Result<Vec<Vec<T>>>
    where
        F: AsyncRangeFetcher,
        T: Send + 'static,
    {
        self.run(async move {
            let count = jobs.len();
            let mut set = JoinSet::new();
            for (pos, job) in jobs.into_iter().enumerate() {
                set.spawn(async move {
                    gather(job.source, job.ranges, job.transform)
                        .await
                        .map(|results| (pos, results))
                });
            }
            collect_ordered(set, count).await
        })
    }
}

/// Fetch `ranges` from `source` concurrently on the current runtime
async fn gather<F, T>(
    source: Arc<F>,
    ranges: Vec<Range<u64>>,
    transform: Transform<T>,
) -> Result<Vec<T>>
where
    F: AsyncRangeFetcher,
    T: Send + 'static,
{
    let count = ranges.len();
    let mut set = JoinSet::new();
    for (pos, range) in ranges.into_iter().enumerate() {
        let source = Arc::clone(&source);
        let transform = Arc::clone(&transform);
        set.spawn(async move {
            let bytes = source
                .afetch(range.start, range.end)
                .await
                .map_err(CacheError::Fetch)?;
            Ok::<_, CacheError>((pos, transform(bytes)))
        });
    }
    collect_ordered(set, count).await
}

async fn collect_ordered<T: Send + 'static>(
    mut set: JoinSet<Result<(usize, T)>>,
    count: usize,
) -> Result<Vec<T>> {
    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let outcome = joined.map_err(CacheError::Task).and_then(|inner| inner);
        match outcome {
            Ok((pos, value)) => slots[pos] = Some(value),
            Err(e) => {
                set.detach_all();
                return Err(e);
            }
        }
    }
    slots
        .into_iter()
        .map(|slot| slot.ok_or(CacheError::BridgeClosed))
        .collect()
}
