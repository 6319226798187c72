//! Bounded Reader Pool
//!
//! Concurrent readers that share a single file descriptor race on the
//! kernel's per-descriptor file position: interleaved `seek` + `read`
//! pairs produce reads from garbage offsets. This engine therefore owns
//! a **bounded pool of independent read handles** — each with its own
//! position state — and every read in the process goes through it.
//!
//! Architectural invariant: **no component opens ad-hoc read handles on
//! the database file outside this pool.** The writer holds exactly one
//! additional handle, so the count of open descriptors on the file is
//! always ≤ `capacity + 1`.
//!
//! # Acquire semantics
//!
//! [`ReaderPool::acquire`] blocks up to a caller-supplied deadline when
//! every handle is leased, then fails with [`PoolError::Timeout`] —
//! there are no infinite waits on the read path. Leases return their
//! handle on drop. After [`ReaderPool::shutdown`] every waiter and
//! every subsequent acquire fails with [`PoolError::ShutDown`], and
//! returned handles are closed instead of pooled.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Underlying I/O error while opening handles.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The deadline elapsed before a handle became free. Retryable.
    #[error("Timed out waiting for a read handle")]
    Timeout,

    /// The pool has been shut down.
    #[error("Reader pool is shut down")]
    ShutDown,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Pool core
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct PoolState {
    /// Idle handles ready to lease.
    idle: Vec<File>,

    /// Handles currently leased out.
    leased: usize,

    /// Once set, no further leases are granted and returned handles
    /// are closed.
    shut_down: bool,
}

#[derive(Debug)]
struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
}

/// A bounded pool of independent read handles on the database file.
///
/// Cloneable; all clones share the same handles.
#[derive(Clone)]
pub struct ReaderPool {
    shared: Arc<PoolShared>,
}

impl ReaderPool {
    /// Open `capacity` independent read-only handles on `path`.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(OpenOptions::new().read(true).open(path)?);
        }

        info!(path = %path.display(), capacity, "reader pool opened");

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle,
                    leased: 0,
                    shut_down: false,
                }),
                available: Condvar::new(),
                capacity,
            }),
        })
    }

    /// Lease a handle, waiting up to `timeout` for one to come free.
    pub fn acquire(&self, timeout: Duration) -> Result<ReaderLease, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| PoolError::Internal("pool mutex poisoned".into()))?;

        loop {
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if let Some(file) = state.idle.pop() {
                state.leased += 1;
                return Ok(ReaderLease {
                    file: Some(file),
                    shared: Arc::clone(&self.shared),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout);
            }
            let (guard, wait) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| PoolError::Internal("pool mutex poisoned".into()))?;
            state = guard;
            if wait.timed_out() && state.idle.is_empty() {
                if state.shut_down {
                    return Err(PoolError::ShutDown);
                }
                return Err(PoolError::Timeout);
            }
        }
    }

    /// Close every idle handle and fail all waiters. Leased handles are
    /// closed as they come back.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shut_down = true;
            let closed = state.idle.len();
            state.idle.clear();
            debug!(closed, leased = state.leased, "reader pool shut down");
        }
        self.shared.available.notify_all();
    }

    /// Configured handle count.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handles currently leased out.
    pub fn in_use(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|s| s.leased)
            .unwrap_or(self.shared.capacity)
    }
}

// ------------------------------------------------------------------------------------------------
// Lease
// ------------------------------------------------------------------------------------------------

/// A leased read handle. Returns itself to the pool on drop.
///
/// The handle's file position belongs exclusively to this lease, so
/// plain `seek` + `read_exact` sequences are race-free.
#[derive(Debug)]
pub struct ReaderLease {
    file: Option<File>,
    shared: Arc<PoolShared>,
}

impl ReaderLease {
    /// Read exactly `len` bytes starting at absolute `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("lease already returned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Ok(mut state) = self.shared.state.lock() {
            state.leased = state.leased.saturating_sub(1);
            if !state.shut_down {
                state.idle.push(file);
            }
            // A closed pool drops the handle here instead.
        }
        self.shared.available.notify_one();
    }
}
