//! In-memory capabilities for tests: count calls, record ranges, optionally
//! sleep or fail.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;

use crate::source::{AsyncRangeFetcher, ByteStream, ObjectStore, RangeFetcher};

/// Deterministic non-repeating-per-block content
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub struct MemoryObject {
    data: Vec<u8>,
    delay: Duration,
    failing: AtomicBool,
    calls: AtomicUsize,
    ranges: Mutex<Vec<Range<u64>>>,
}

impl MemoryObject {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Range<u64>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Counted at entry so other threads can see a fetch is in progress
    fn record(&self, start: u64, end: u64) {
        self.ranges.lock().unwrap().push(start..end);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn slice(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("simulated fetch failure for {}..{}", start, end);
        }
        if end as usize > self.data.len() || start > end {
            bail!("range {}..{} outside object of {} bytes", start, end, self.data.len());
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

impl RangeFetcher for MemoryObject {
    fn fetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.record(start, end);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.slice(start, end)
    }
}

impl AsyncRangeFetcher for MemoryObject {
    async fn afetch(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.record(start, end);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.slice(start, end)
    }
}

/// Store of named in-memory objects
pub struct MemoryStore {
    objects: HashMap<String, Arc<MemoryObject>>,
    local: bool,
    stream_chunk: usize,
    fail_stream_after: Option<usize>,
    streams_opened: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            local: false,
            stream_chunk: 1000,
            fail_stream_after: None,
            streams_opened: AtomicUsize::new(0),
        }
    }

    pub fn with_object(mut self, id: &str, data: Vec<u8>) -> Self {
        self.objects
            .insert(id.to_string(), Arc::new(MemoryObject::new(data)));
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_stream_chunk(mut self, chunk: usize) -> Self {
        self.stream_chunk = chunk;
        self
    }

    /// Streams error out after yielding this many chunks
    pub fn failing_stream_after(mut self, chunks: usize) -> Self {
        self.fail_stream_after = Some(chunks);
        self
    }

    pub fn object(&self, id: &str) -> &Arc<MemoryObject> {
        &self.objects[id]
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: &str) -> anyhow::Result<&Arc<MemoryObject>> {
        match self.objects.get(id) {
            Some(object) => Ok(object),
            None => bail!("no such object: {}", id),
        }
    }
}

pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    yielded: usize,
    fail_after: Option<usize>,
}

impl ByteStream for MemoryStream {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        if self.fail_after == Some(self.yielded) {
            bail!("simulated stream failure at byte {}", self.pos);
        }
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + self.chunk).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        self.yielded += 1;
        Ok(Some(chunk))
    }
}

impl ObjectStore for MemoryStore {
    type Stream = MemoryStream;

    fn fetch(&self, id: &str, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.lookup(id)?.fetch(start, end)
    }

    async fn afetch(&self, id: &str, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        self.lookup(id)?.afetch(start, end).await
    }

    fn is_local(&self, _id: &str) -> bool {
        self.local
    }

    async fn open_stream(&self, id: &str) -> anyhow::Result<MemoryStream> {
        let object = self.lookup(id)?;
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryStream {
            data: object.data().to_vec(),
            pos: 0,
            chunk: self.stream_chunk,
            yielded: 0,
            fail_after: self.fail_stream_after,
        })
    }

    async fn size(&self, id: &str) -> anyhow::Result<u64> {
        Ok(self.lookup(id)?.data().len() as u64)
    }
}
