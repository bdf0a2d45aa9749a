//! Advisory lock serialising first-time creation of a cache file pair.

use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::error::{CacheError, Result};

/// Exclusive `flock` held on a sibling lock file; released on drop
pub struct CreationLock {
    _lock: Flock<File>,
}

impl CreationLock {
    /// Block until the lock at `path` is held by this process
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CacheError::io(path, std::io::Error::from(errno)))?;

        trace!(path = %path.display(), "Acquired creation lock");
        Ok(Self { _lock: lock })
    }
}
