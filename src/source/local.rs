//! Objects already on local disk.
//!
//! Useful for slow local media and for testing; reports every object as
//! local so no background prefetch is started for it.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use super::{ByteStream, ObjectStore};

/// Stream read size
const STREAM_CHUNK: usize = 1024 * 1024;

/// Files below a root directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, id: &str) -> PathBuf {
        self.root.join(id.trim_start_matches('/'))
    }
}

fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut buf = vec![0u8; end.saturating_sub(start) as usize];
    file.read_exact_at(&mut buf, start)
        .with_context(|| format!("Failed to read {}..{} from {:?}", start, end, path))?;
    Ok(buf)
}

pub struct LocalStream {
    file: tokio::fs::File,
}

impl ByteStream for LocalStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

impl ObjectStore for LocalStore {
    type Stream = LocalStream;

    fn fetch(&self, id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        read_range(&self.resolve(id), start, end)
    }

    async fn afetch(&self, id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let path = self.resolve(id);
        tokio::task::spawn_blocking(move || read_range(&path, start, end)).await?
    }

    fn is_local(&self, _id: &str) -> bool {
        true
    }

    async fn open_stream(&self, id: &str) -> Result<LocalStream> {
        let path = self.resolve(id);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {:?}", path))?;
        Ok(LocalStream { file })
    }

    async fn size(&self, id: &str) -> Result<u64> {
        let path = self.resolve(id);
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {:?}", path))?;
        Ok(metadata.len())
    }
}
