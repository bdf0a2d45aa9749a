//! Fork-aware lazy value holder
//!
//! A value is tagged with the process id that built it. When read from a
//! different process (the parent forked) the stale value is dropped and
//! rebuilt, so sockets, threads and runtime handles never cross a fork.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

struct Owned<T> {
    value: T,
    owner_pid: u32,
}

/// Lazily built value owned by the current process
pub struct ProcessLocal<T> {
    slot: Mutex<Option<Owned<T>>>,
}

impl<T: Clone> ProcessLocal<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Current value, building it with `factory` on first use in this process
    pub fn get<F>(&self, factory: F) -> T
    where
        F: FnOnce() -> T,
    {
        match self.try_get(|| Ok::<T, std::convert::Infallible>(factory())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`get`](Self::get) but with a fallible factory; nothing is stored on error
    pub fn try_get<F, E>(&self, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.try_get_for(std::process::id(), factory)
    }

    fn try_get_for<F, E>(&self, pid: u32, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(owned) if owned.owner_pid == pid => return Ok(owned.value.clone()),
            Some(owned) => {
                debug!(
                    owner_pid = owned.owner_pid,
                    pid = pid,
                    "Process changed, rebuilding process-local value"
                );
                *slot = None;
            }
            None => {}
        }

        let value = factory()?;
        *slot = Some(Owned {
            value: value.clone(),
            owner_pid: pid,
        });
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Owned<T>>> {
        // The value is rebuilt on demand, so a poisoned slot is still usable
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> Default for ProcessLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}
