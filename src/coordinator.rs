//! Block fetch coordinator
//!
//! Serves byte ranges out of a shared [`BlockFiles`] pair, fetching missing
//! blocks through an injected capability. Readers in any thread, task or
//! process cooperate through the index bytes alone:
//!
//! ```text
//! EMPTY --claim--> CLAIMED --fetched--> DONE
//!                  CLAIMED --other reader timed out--> EMPTY
//! ```
//!
//! A reader claims every EMPTY block it needs, coalescing contiguous claims
//! into a single fetch, and polls blocks claimed by others until they are
//! DONE. If a claimant makes no progress within the parallel timeout, its
//! blocks are reset to EMPTY and the waiter fetches them itself.
//!
//! Claims use a byte compare-and-swap on the shared mapping, so two readers
//! cannot both win the same claim. Reclaim races and [`BlockCache::fill`]
//! can still lead to a block being written twice; that is harmless because
//! the content of a given offset never changes.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::{CacheConfig, DEFAULT_PARALLEL_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::error::{CacheError, Result};
use crate::source::{AsyncRangeFetcher, RangeFetcher};
use crate::store::{BlockFiles, BlockIndex, BlockState, FilePaths};

/// Identity and geometry of one cached object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDescriptor {
    pub source_id: String,
    pub total_size: u64,
    pub block_size: u64,
}

/// How long to wait on blocks claimed by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub parallel_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            parallel_timeout: DEFAULT_PARALLEL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&CacheConfig> for WaitPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            parallel_timeout: config.parallel_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// A run of contiguous blocks claimed together and fetched with one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchJob {
    pub first_block: usize,
    pub last_block: usize,
    /// Byte range covered, clamped to the object size
    pub start: u64,
    pub end: u64,
}

impl FetchJob {
    pub fn blocks(&self) -> RangeInclusive<usize> {
        self.first_block..=self.last_block
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Counters for one open cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served without fetching or waiting
    pub hits: u64,
    /// Reads that found at least one block missing
    pub misses: u64,
    /// Fetch calls issued
    pub fetches: u64,
    pub bytes_fetched: u64,
    /// Blocks taken over from a stalled claimant
    pub reclaims: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    bytes_fetched: AtomicU64,
    reclaims: AtomicU64,
}

/// Persistent block cache over one object
pub struct BlockCache<F> {
    descriptor: CacheDescriptor,
    files: BlockFiles,
    fetcher: Arc<F>,
    policy: WaitPolicy,
    counters: Counters,
}

impl<F> BlockCache<F> {
    /// Open (creating if needed) the file pair at `paths` for `descriptor`
    pub fn open(
        descriptor: CacheDescriptor,
        paths: &FilePaths,
        fetcher: Arc<F>,
        policy: WaitPolicy,
    ) -> Result<Self> {
        let files = BlockFiles::open(descriptor.total_size, descriptor.block_size, paths)?;
        Ok(Self {
            descriptor,
            files,
            fetcher,
            policy,
            counters: Counters::default(),
        })
    }

    pub fn descriptor(&self) -> &CacheDescriptor {
        &self.descriptor
    }

    pub fn total_size(&self) -> u64 {
        self.descriptor.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.descriptor.block_size
    }

    pub fn files(&self) -> &BlockFiles {
        &self.files
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            bytes_fetched: self.counters.bytes_fetched.load(Ordering::Relaxed),
            reclaims: self.counters.reclaims.load(Ordering::Relaxed),
        }
    }

    /// Whether a background prefetch has filled the whole object
    pub fn is_complete(&self) -> bool {
        // An empty object is trivially complete
        self.files.index().map_or(true, BlockIndex::is_complete)
    }

    pub(crate) fn mark_complete(&self) {
        if let Some(index) = self.files.index() {
            index.mark_complete();
        }
    }

    fn clamp(&self, start: u64, end: u64) -> (u64, u64) {
        let end = end.min(self.total_size());
        (start.min(end), end)
    }

    /// Byte range of block `i`
    fn block_range(&self, i: usize) -> (u64, u64) {
        let bs = self.block_size();
        let start = i as u64 * bs;
        (start, (start + bs).min(self.total_size()))
    }

    /// Blocks overlapping `[start, end)` that are not DONE, in order
    pub fn get_need(&self, start: u64, end: u64) -> Vec<usize> {
        let Some(index) = self.files.index() else {
            return Vec::new();
        };
        let (start, end) = self.clamp(start, end);
        if start >= end {
            return Vec::new();
        }
        let bs = self.block_size();
        let first = (start / bs) as usize;
        let last = ((end - 1) / bs) as usize;
        (first..=last).filter(|&i| !index.is_done(i)).collect()
    }

    /// Claim what can be claimed out of `need`
    ///
    /// Returns the claimed runs as fetch jobs, plus the blocks currently
    /// claimed by someone else. Blocks that became DONE meanwhile are dropped.
    pub fn partition(&self, need: &[usize]) -> (Vec<FetchJob>, Vec<usize>) {
        let mut jobs = Vec::new();
        let mut waiting = Vec::new();
        let Some(index) = self.files.index() else {
            return (jobs, waiting);
        };

        let mut pos = 0;
        while pos < need.len() {
            let first = need[pos];
            pos += 1;
            if !index.try_claim(first) {
                if index.state(first) != BlockState::Done {
                    waiting.push(first);
                }
                continue;
            }
            let mut last = first;
            while pos < need.len() && need[pos] == last + 1 && index.try_claim(need[pos]) {
                last = need[pos];
                pos += 1;
            }
            let (start, _) = self.block_range(first);
            let (_, end) = self.block_range(last);
            jobs.push(FetchJob {
                first_block: first,
                last_block: last,
                start,
                end,
            });
        }
        (jobs, waiting)
    }

    /// Write `data` at `offset` and publish every block it fully covers
    ///
    /// Skips the claim step entirely; blocks already DONE are left untouched.
    pub fn fill(&self, offset: u64, data: &[u8]) {
        let Some(index) = self.files.index() else {
            return;
        };
        let end = offset
            .saturating_add(data.len() as u64)
            .min(self.total_size());
        if offset >= end {
            return;
        }
        let bs = self.block_size();
        let first = (offset / bs) as usize;
        let last = ((end - 1) / bs) as usize;
        for i in first..=last {
            if index.is_done(i) {
                continue;
            }
            let (block_start, block_end) = self.block_range(i);
            let write_start = block_start.max(offset);
            let write_end = block_end.min(end);
            self.files.write(
                write_start,
                &data[(write_start - offset) as usize..(write_end - offset) as usize],
            );
            if block_start >= offset && block_end <= end {
                index.mark_done(i);
            }
        }
    }

    /// Store a finished job and publish its blocks
    fn complete(&self, index: &BlockIndex, job: &FetchJob, data: Vec<u8>) -> Result<()> {
        if data.len() as u64 != job.len() {
            return Err(CacheError::ShortFetch {
                start: job.start,
                end: job.end,
                actual: data.len(),
            });
        }
        // Bytes first, then the index, so DONE always implies complete data
        self.files.write(job.start, &data);
        for i in job.blocks() {
            index.mark_done(i);
        }
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_fetched
            .fetch_add(job.len(), Ordering::Relaxed);
        Ok(())
    }

    fn record_lookup(&self, need: &[usize]) {
        if need.is_empty() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// No block in `waiting` is still held by another claimant
    fn settled(index: &BlockIndex, waiting: &[usize]) -> bool {
        waiting
            .iter()
            .all(|&i| index.state(i) != BlockState::Claimed)
    }

    /// Take over blocks whose claimant appears to have stalled
    fn reclaim(&self, index: &BlockIndex, waiting: &[usize]) {
        let reclaimed = waiting.iter().filter(|&&i| index.reclaim(i)).count();
        if reclaimed > 0 {
            self.counters
                .reclaims
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            warn!(
                source = %self.descriptor.source_id,
                blocks = reclaimed,
                timeout_ms = self.policy.parallel_timeout.as_millis() as u64,
                "Claimant stalled, reclaiming blocks"
            );
        }
    }

    fn log_job(&self, job: &FetchJob) {
        debug!(
            source = %self.descriptor.source_id,
            first_block = job.first_block,
            last_block = job.last_block,
            start = job.start,
            end = job.end,
            "Fetching blocks"
        );
    }
}

impl<F: RangeFetcher> BlockCache<F> {
    /// Bytes `[start, end)`, fetching missing blocks on the calling thread
    pub fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let Some(index) = self.files.index() else {
            return Ok(Vec::new());
        };
        let (start, end) = self.clamp(start, end);
        if start >= end {
            return Ok(Vec::new());
        }

        let mut need = self.get_need(start, end);
        self.record_lookup(&need);
        while !need.is_empty() {
            let (jobs, waiting) = self.partition(&need);
            for job in &jobs {
                self.log_job(job);
                let data = self
                    .fetcher
                    .fetch(job.start, job.end)
                    .map_err(CacheError::Fetch)?;
                self.complete(index, job, data)?;
            }
            self.wait(index, &waiting);
            need = self.get_need(start, end);
        }

        Ok(self.files.read(start, end))
    }

    fn wait(&self, index: &BlockIndex, waiting: &[usize]) {
        if waiting.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.policy.parallel_timeout;
        while !Self::settled(index, waiting) {
            if Instant::now() >= deadline {
                self.reclaim(index, waiting);
                return;
            }
            trace!(blocks = waiting.len(), "Waiting on claimed blocks");
            std::thread::sleep(self.policy.poll_interval);
        }
    }
}

impl<F: AsyncRangeFetcher> BlockCache<F> {
    /// Bytes `[start, end)`; missing runs are fetched concurrently
    ///
    /// Dropping the future while it waits leaves the index untouched.
    pub async fn aread(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let Some(index) = self.files.index() else {
            return Ok(Vec::new());
        };
        let (start, end) = self.clamp(start, end);
        if start >= end {
            return Ok(Vec::new());
        }

        let mut need = self.get_need(start, end);
        self.record_lookup(&need);
        while !need.is_empty() {
            let (jobs, waiting) = self.partition(&need);
            if !jobs.is_empty() {
                self.fetch_jobs(index, jobs).await?;
            }
            self.await_claims(index, &waiting).await;
            need = self.get_need(start, end);
        }

        Ok(self.files.read(start, end))
    }

    async fn fetch_jobs(&self, index: &BlockIndex, jobs: Vec<FetchJob>) -> Result<()> {
        let mut set = JoinSet::new();
        for job in jobs {
            self.log_job(&job);
            let fetcher = Arc::clone(&self.fetcher);
            set.spawn(async move { (job, fetcher.afetch(job.start, job.end).await) });
        }

        // Every job that succeeds is published, even after a sibling failed;
        // only the failed job's blocks are left for reclaim.
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(CacheError::Task)
                .and_then(|(job, fetched)| {
                    let data = fetched.map_err(CacheError::Fetch)?;
                    self.complete(index, &job, data)
                });
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn await_claims(&self, index: &BlockIndex, waiting: &[usize]) {
        if waiting.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.policy.parallel_timeout;
        while !Self::settled(index, waiting) {
            if Instant::now() >= deadline {
                self.reclaim(index, waiting);
                return;
            }
            trace!(blocks = waiting.len(), "Waiting on claimed blocks");
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }
}

impl<F: RangeFetcher> RangeFetcher for BlockCache<F> {
    fn fetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        Ok(self.read(start, end)?)
    }
}

impl<F: AsyncRangeFetcher> AsyncRangeFetcher for BlockCache<F> {
    async fn afetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        Ok(self.aread(start, end).await?)
    }
}
