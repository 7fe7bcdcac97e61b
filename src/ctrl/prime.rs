//! # Prime Lock
//!
//! A single lock that spans the whole lock manager, e.g. to quiesce every transaction before a
//! checkpoint. It only knows [`LockMode::Shared`] and [`LockMode::Exclusive`] and is backed by a
//! semaphore: a shared holder takes one permit, an exclusive holder takes all of them.
//!
//! Closing the lock manager closes the semaphore, which fails every outstanding wait. Opening it
//! again installs a fresh semaphore. Guards that were handed out before keep their permits on the
//! old semaphore.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    base::{HlmError, HlmResult},
    ctrl::{LockMode, LockTimeout},
};

#[derive(Debug)]
pub(crate) struct PrimeLock {
    max_readers: u32,
    semaphore: RwLock<Arc<Semaphore>>,
}

impl PrimeLock {
    /// Creates a closed prime lock, which has to be reopened before use.
    pub(crate) fn new(max_readers: u32) -> Self {
        let max_readers = max_readers.max(1);
        let semaphore = Semaphore::new(max_readers as usize);
        semaphore.close();
        Self {
            max_readers,
            semaphore: RwLock::new(Arc::new(semaphore)),
        }
    }

    pub(crate) fn reopen(&self) {
        *self.semaphore.write() = Arc::new(Semaphore::new(self.max_readers as usize));
    }

    pub(crate) fn close(&self) {
        self.semaphore.read().close();
    }

    pub(crate) async fn acquire(
        &self,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> HlmResult<PrimeLockGuard> {
        let permits = match mode {
            LockMode::Shared => 1,
            LockMode::Exclusive => self.max_readers,
            mode => return Err(HlmError::InvalidPrimeLockMode(mode)),
        };

        let semaphore = self.semaphore.read().clone();
        let acquire = semaphore.acquire_many_owned(permits);
        let permit = match timeout.duration() {
            None => acquire.await?,
            Some(duration) => tokio::time::timeout(duration, acquire).await??,
        };
        Ok(PrimeLockGuard {
            mode,
            _permit: permit,
        })
    }
}

/// Holds the prime lock until dropped.
#[derive(Debug)]
#[must_use = "the prime lock is released as soon as the guard is dropped"]
pub struct PrimeLockGuard {
    mode: LockMode,
    _permit: OwnedSemaphorePermit,
}

impl PrimeLockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}
