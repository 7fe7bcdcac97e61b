//! # Hierarchical Lock Manager
//!
//! The HLM coordinates concurrent access of owners (usually transactions) to named resources.
//! Rather than modeling the classic database/table/page/row hierarchy explicitly, the HLM operates
//! purely on resource names and lock modes. The hierarchy lives in the protocol of the callers:
//! before locking a row, a transaction takes an intent lock on the table that contains it.
//!
//! ```not_rust
//! Database lock:  "/db"              IX
//! Table lock:     "/db/users"        IX
//! Row lock:       "/db/users/42"     X
//! ```
//!
//! The HLM itself has no knowledge of that structure. It only guarantees that two modes held on
//! the same name by different owners are compatible, see [`crate::ctrl::mode`].
//!
//! ## Granting
//!
//! Every resource has an aggregate granted mode, which folds all granted modes into the most
//! restrictive one. A request is checked against that aggregate only:
//!
//! ```not_rust
//!       Lock Request
//!            |
//!   Owner holds resource?
//!            |
//!     no-----+-----------yes
//!     |                   |
//!  Waiters present?   Same mode?
//!     |                   |
//!  no-+--yes         yes--+---no
//!  |      |           |        |
//!  |   Enqueue    Increment  Compatible with aggregate,
//!  |              counter    or sole owner?
//!  |                              |
//! Compatible with           yes---+---no
//! aggregate?                 |         |
//!  |                       Grant    Enqueue as upgrade
//!  yes--+--no
//!  |        |
//! Grant   Enqueue
//! ```
//!
//! Enqueued requests either wait until they are promoted, or until their timeout expires. A
//! request with a timeout of zero is never enqueued and times out right away.
//!
//! ## Promotion
//!
//! Whenever a granted request is released or a waiting request expires, the aggregate of the
//! resource is recomputed and the waiting queue is walked from the front. Every waiter that is
//! compatible with the aggregate (or whose owner is the only one holding the resource) is granted,
//! until the first waiter that is not. Waiters behind it are never granted ahead of it, even if
//! they would be compatible.
//!
//! Upgrades (requests of owners that already hold another mode on the resource) are queued ahead
//! of all ordinary waiters, but behind earlier upgrades.
//!
//! ## Lifecycle
//!
//! ```not_rust
//! Closed --open--> Open --close--> Closing --drained--> Closed
//!                                     |
//!                                     +-----abort-----> Closed
//! ```
//!
//! While not open, requests are resolved with [`LockStatus::Timeout`] right away. Closing times
//! out every waiting request, and then waits until all granted locks have been released.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::instrument;

use crate::{
    base::{HlmError, HlmResult, OwnerId},
    ctrl::{
        LockHandle, LockManagerConfig, LockMode, LockStatus, LockTimeout, LockWaiter,
        UnlockStatus,
        prime::{PrimeLock, PrimeLockGuard},
        request::LockRequest,
        table::{Entered, Holding, LockResource, LockResourceSnapshot, LockTable},
    },
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    Closed,
    Open,
    /// Waiting for granted locks to be released, before becoming [`ManagerState::Closed`].
    Closing,
}

#[derive(Debug)]
struct Lifecycle {
    state: ManagerState,
    owner: Option<OwnerId>,
    /// Runtime of the task that opened the manager. Expiration timers are spawned onto it.
    runtime: Option<Handle>,
    /// Number of closes that have been started, identifies the current drain.
    epoch: u64,
}

#[derive(Debug)]
struct ManagerInner {
    id: u64,
    config: LockManagerConfig,
    table: LockTable,
    /// Only ever flipped to `false` while holding every shard write lock of the table.
    accepting: AtomicBool,
    lifecycle: RwLock<Lifecycle>,
    /// Epoch of the latest close whose drain completed. Never moves backwards.
    drained: watch::Sender<u64>,
    prime: PrimeLock,
}

/// Grants, queues, upgrades, times out and releases named locks on behalf of concurrent owners.
///
/// A manager has to be [opened](LockManager::open) from within a tokio runtime, which drives the
/// expiration timers of waiting requests.
#[derive(Debug)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        let (drained, _) = watch::channel(0);
        let inner = ManagerInner {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            table: LockTable::new(config.table_shards),
            prime: PrimeLock::new(config.max_prime_readers),
            config,
            accepting: AtomicBool::new(false),
            lifecycle: RwLock::new(Lifecycle {
                state: ManagerState::Closed,
                owner: None,
                runtime: None,
                epoch: 0,
            }),
            drained,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Starts accepting lock requests on behalf of `owner`, which is only kept for diagnostics.
    ///
    /// Fails if the manager is open already, or still waiting for a close to drain.
    #[instrument(skip_all, level = "info")]
    pub fn open(&self, owner: impl Into<OwnerId>) -> HlmResult<()> {
        let owner = owner.into();
        if owner.is_empty() {
            return Err(HlmError::invalid_argument("owner", "must not be empty"));
        }
        let runtime = Handle::try_current().map_err(|_| HlmError::NoRuntime)?;

        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.write();
        match lifecycle.state {
            ManagerState::Closed => {}
            ManagerState::Open => {
                let current = lifecycle.owner.as_ref().map(OwnerId::to_string);
                return Err(HlmError::AlreadyOpen(current.unwrap_or_default()));
            }
            ManagerState::Closing => return Err(HlmError::StillClosing),
        }

        info!(
            %owner,
            leftover = inner.table.len(),
            "lock manager is accepting requests"
        );
        inner.prime.reopen();
        lifecycle.state = ManagerState::Open;
        lifecycle.owner = Some(owner);
        lifecycle.runtime = Some(runtime);
        inner.accepting.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops accepting requests, times out every waiting request, and waits until every granted
    /// lock has been released.
    ///
    /// If the returned future is dropped early, the manager stays [`ManagerState::Closing`]
    /// until it is closed again or aborted.
    #[instrument(skip(self), level = "info")]
    pub async fn close(&self) {
        let inner = &self.inner;
        let Some((epoch, remaining)) = inner.begin_close() else {
            debug!("lock manager is closed already");
            return;
        };
        if remaining > 0 {
            info!(remaining, "waiting for granted locks to be released");
            let mut drained = inner.drained.subscribe();
            // NB: the sender is owned by `inner`, so the channel can not close while we wait
            let _ = drained.wait_for(|drained| *drained >= epoch).await;
        }
        inner.finish_close();
    }

    /// Closes the manager without waiting for granted locks. They can still be released later.
    #[instrument(skip(self), level = "info")]
    pub fn abort(&self) {
        let inner = &self.inner;
        if let Some((_, remaining)) = inner.begin_close() {
            if remaining > 0 {
                warn!(remaining, "aborting lock manager with granted locks outstanding");
            }
        }
        // also wakes up a close that is still draining
        inner.finish_close();
    }

    /// Requests a lock on `resource_name` in `mode` for `owner`.
    ///
    /// The returned [`LockWaiter`] is already resolved if the request could be decided right away:
    /// it was granted, it is a re-acquisition of a mode the owner holds, the timeout is zero, or
    /// the manager is not open. Otherwise it resolves once the request is granted or expires.
    #[instrument(skip(self), level = "trace")]
    pub fn acquire(
        &self,
        owner: &OwnerId,
        resource_name: &str,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> HlmResult<LockWaiter> {
        if mode == LockMode::Free {
            return Err(HlmError::invalid_argument("mode", "can not acquire Free"));
        }
        if owner.is_empty() {
            return Err(HlmError::invalid_argument("owner", "must not be empty"));
        }
        if resource_name.trim().is_empty() {
            return Err(HlmError::invalid_argument(
                "resource_name",
                "must not be empty",
            ));
        }

        let inner = &self.inner;
        // NB: looked up before the resource is locked, the lifecycle lock is never taken inside
        let runtime = timeout
            .duration()
            .filter(|duration| !duration.is_zero())
            .and_then(|_| inner.runtime());

        let mut resource = match inner.table.enter(resource_name, &inner.accepting) {
            Entered::Locked(resource) => resource,
            Entered::Rejected => {
                trace!("lock manager is not accepting requests");
                let request =
                    inner.new_request(owner, Arc::from(resource_name), mode, timeout, false);
                request.time_out_now();
                return Ok(LockWaiter::ready(LockHandle(Arc::new(request))));
            }
        };

        let is_upgrade = match resource.holding(owner, mode) {
            Holding::SameMode(request) => {
                let count = request.add_reference();
                trace!(count, "lock re-acquired by its owner");
                return Ok(LockWaiter::ready(LockHandle(request.clone())));
            }
            Holding::OtherMode => {
                if mode.is_compatible_with(resource.granted_mode)
                    || resource.is_single_owner(Some(owner))
                {
                    return Ok(inner.grant_now(&mut resource, owner, mode, timeout));
                }
                true
            }
            Holding::Nothing => {
                if resource.waiting.is_empty() && mode.is_compatible_with(resource.granted_mode) {
                    return Ok(inner.grant_now(&mut resource, owner, mode, timeout));
                }
                false
            }
        };

        let request = Arc::new(inner.new_request(
            owner,
            resource.name().clone(),
            mode,
            timeout,
            is_upgrade,
        ));
        if timeout.is_zero() {
            trace!(
                granted_mode = %resource.granted_mode,
                is_upgrade,
                "lock not available, not waiting"
            );
            request.time_out_now();
            return Ok(LockWaiter::ready(LockHandle(request)));
        }

        let rx = request.make_pending();
        resource.enqueue(request.clone());
        match (timeout.duration(), runtime) {
            (Some(duration), Some(runtime)) => {
                request.start_expire(inner.arm_expiration(&runtime, &request, duration));
            }
            (Some(_), None) => warn!("no runtime to expire lock request, waiting indefinitely"),
            (None, _) => {}
        }
        trace!(
            granted_mode = %resource.granted_mode,
            is_upgrade,
            waiting = resource.waiting.len(),
            "lock request enqueued"
        );
        Ok(LockWaiter::pending(LockHandle(request), rx))
    }

    /// Requests a lock like [`LockManager::acquire`] and waits for the decision.
    pub async fn acquire_lock(
        &self,
        owner: &OwnerId,
        resource_name: &str,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> HlmResult<LockHandle> {
        Ok(self.acquire(owner, resource_name, mode, timeout)?.await)
    }

    /// Releases one acquisition of `handle`. The lock is given up once every acquisition of it
    /// has been released.
    ///
    /// Fails if `handle` was handed out by another lock manager.
    pub fn release(&self, handle: &LockHandle) -> HlmResult<UnlockStatus> {
        self.inner.release(handle.request())
    }

    /// Acquires the manager-wide prime lock, in either [`LockMode::Shared`] or
    /// [`LockMode::Exclusive`].
    pub async fn acquire_prime_lock(
        &self,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> HlmResult<PrimeLockGuard> {
        let guard = self.inner.prime.acquire(mode, timeout).await?;
        trace!(%mode, "prime lock acquired");
        Ok(guard)
    }

    pub fn release_prime_lock(&self, guard: PrimeLockGuard) {
        trace!(mode = %guard.mode(), "prime lock released");
        drop(guard);
    }

    /// Returns `true` for the modes that only read.
    #[inline]
    pub const fn is_shared(mode: LockMode) -> bool {
        mode.is_shared()
    }

    /// The owner this manager was last opened for.
    pub fn owner(&self) -> Option<OwnerId> {
        self.inner.lifecycle.read().owner.clone()
    }

    pub fn state(&self) -> ManagerState {
        self.inner.lifecycle.read().state
    }

    /// Number of resources that are currently locked or waited for.
    pub fn resource_count(&self) -> usize {
        self.inner.table.len()
    }

    /// A copy of the lock state of `resource_name`, if anything is held or waited for on it.
    pub fn snapshot(&self, resource_name: &str) -> Option<LockResourceSnapshot> {
        self.inner.table.snapshot(resource_name)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if self.state() != ManagerState::Closed {
            warn!("lock manager dropped without being closed");
            self.abort();
        }
    }
}

impl ManagerInner {
    fn runtime(&self) -> Option<Handle> {
        self.lifecycle.read().runtime.clone()
    }

    fn new_request(
        &self,
        owner: &OwnerId,
        resource_name: Arc<str>,
        mode: LockMode,
        timeout: LockTimeout,
        is_upgrade: bool,
    ) -> LockRequest {
        LockRequest::new(
            self.id,
            owner.clone(),
            resource_name,
            mode,
            timeout,
            is_upgrade,
        )
    }

    fn grant_now(
        &self,
        resource: &mut LockResource,
        owner: &OwnerId,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> LockWaiter {
        let request = Arc::new(self.new_request(owner, resource.name().clone(), mode, timeout, false));
        request.grant_now();
        resource.push_granted(request.clone());
        trace!(granted_mode = %resource.granted_mode, "lock granted");
        LockWaiter::ready(LockHandle(request))
    }

    fn arm_expiration(
        self: &Arc<Self>,
        runtime: &Handle,
        request: &Arc<LockRequest>,
        duration: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let request = Arc::downgrade(request);
        runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let (Some(manager), Some(request)) = (manager.upgrade(), request.upgrade()) {
                manager.expire(&request);
            }
        })
    }

    fn release(self: &Arc<Self>, request: &Arc<LockRequest>) -> HlmResult<UnlockStatus> {
        if request.manager_id() != self.id {
            return Err(HlmError::invalid_argument(
                "handle",
                "was handed out by another lock manager",
            ));
        }
        let Some(mut resource) = self.table.find(request.resource_name()) else {
            trace!(?request, "released lock on unknown resource");
            return Ok(UnlockStatus::UnknownResource);
        };
        if !resource.is_granted(request) {
            trace!(?request, "released lock that is not granted");
            return Ok(UnlockStatus::NotGranted);
        }

        let count = request.remove_reference();
        if count > 0 {
            trace!(?request, "released one acquisition of lock");
            return Ok(UnlockStatus::Success);
        }
        resource.remove_granted(request);
        request.stop_expire();
        trace!(?request, "lock released");

        let promoted = self.recompute(&mut resource);
        let idle = resource.is_idle();
        drop(resource);
        self.settle(request.resource_name(), promoted, idle);
        Ok(UnlockStatus::Success)
    }

    /// Times out `request`, if it is still waiting.
    fn expire(self: &Arc<Self>, request: &Arc<LockRequest>) {
        let Some(mut resource) = self.table.find(request.resource_name()) else {
            return;
        };
        let Some(position) = resource.dequeue(request) else {
            // granted or closed in the meantime
            return;
        };
        let claimed = request.try_finish(LockStatus::Timeout);
        debug_assert!(claimed, "queued lock request was decided already");
        debug!(?request, position, "lock request timed out");

        let promoted = self.recompute(&mut resource);
        let idle = resource.is_idle();
        drop(resource);
        request.complete();
        self.settle(request.resource_name(), promoted, idle);
    }

    /// Recomputes the aggregate mode of `resource` and promotes waiters from the front of its
    /// queue. The promoted requests are returned, and have to be completed once the resource lock
    /// is released.
    fn recompute(&self, resource: &mut LockResource) -> Vec<Arc<LockRequest>> {
        resource.granted_mode = resource
            .granted
            .iter()
            .fold(LockMode::Free, |mode, request| mode.max(request.mode()));

        let mut promoted = Vec::new();
        while let Some(next) = resource.waiting.front() {
            let permitted = next.mode().is_compatible_with(resource.granted_mode)
                || resource.is_single_owner(Some(next.owner()));
            if !permitted {
                break;
            }
            let Some(next) = resource.waiting.pop_front() else {
                break;
            };
            let claimed = next.try_finish(LockStatus::Granted);
            debug_assert!(claimed, "queued lock request was decided already");
            next.stop_expire();
            resource.push_granted(next.clone());
            trace!(request = ?next, "lock request promoted");
            promoted.push(next);
        }

        debug_assert!(
            resource.is_consistent(),
            "granted locks of {} are inconsistent",
            resource.name()
        );
        promoted
    }

    fn settle(
        self: &Arc<Self>,
        resource_name: &Arc<str>,
        promoted: Vec<Arc<LockRequest>>,
        idle: bool,
    ) {
        for request in promoted {
            request.complete();
        }
        if !idle {
            return;
        }
        let runtime = if self.config.deferred_cleanup {
            self.runtime()
        } else {
            None
        };
        match runtime {
            Some(runtime) => {
                let manager = Arc::downgrade(self);
                let resource_name = resource_name.clone();
                runtime.spawn(async move {
                    if let Some(manager) = manager.upgrade() {
                        manager.clear_lock(&resource_name);
                    }
                });
            }
            None => self.clear_lock(resource_name),
        }
    }

    /// Removes the entry of an idle resource, and signals a draining close once the last entry
    /// is gone.
    fn clear_lock(&self, resource_name: &str) {
        if !self.table.remove_if_idle(resource_name) {
            return;
        }
        trace!(resource = resource_name, "removed idle resource");

        // NB: checked under the lifecycle lock, so that a concurrent abort and open can not slip
        // in between and have a later close observe this drain
        let lifecycle = self.lifecycle.read();
        if lifecycle.state == ManagerState::Closing
            && !self.accepting.load(Ordering::Acquire)
            && self.table.len() == 0
        {
            debug!("last granted lock released, lock manager is drained");
            self.signal_drained(lifecycle.epoch);
        }
    }

    fn signal_drained(&self, epoch: u64) {
        self.drained.send_if_modified(|drained| {
            let advanced = *drained < epoch;
            if advanced {
                *drained = epoch;
            }
            advanced
        });
    }

    /// Moves the manager into [`ManagerState::Closing`], stops accepting requests and times out
    /// every waiting request. Returns the epoch of the close along with the number of resources
    /// that still have granted locks, or `None` if the manager is closed already.
    fn begin_close(&self) -> Option<(u64, usize)> {
        let epoch = {
            let mut lifecycle = self.lifecycle.write();
            match lifecycle.state {
                ManagerState::Closed => return None,
                ManagerState::Closing => {}
                ManagerState::Open => {
                    lifecycle.state = ManagerState::Closing;
                    lifecycle.epoch += 1;
                }
            }
            lifecycle.epoch
        };

        let mut expired = Vec::new();
        let mut granted = 0;
        let mut table = self.table.write_all();
        self.accepting.store(false, Ordering::Release);
        for resource in table.resources() {
            let mut resource = resource.write();
            for request in std::mem::take(&mut resource.waiting) {
                if request.try_finish(LockStatus::Timeout) {
                    request.stop_expire();
                    expired.push(request);
                }
            }
            granted += resource.granted.len();
        }
        let remaining = table.remove_idle();
        drop(table);

        for request in &expired {
            request.complete();
        }
        self.prime.close();
        if remaining == 0 {
            self.signal_drained(epoch);
        }
        info!(
            expired = expired.len(),
            granted, remaining, "lock manager stopped accepting requests"
        );
        Some((epoch, remaining))
    }

    /// Moves a closing manager into [`ManagerState::Closed`] and releases every close still
    /// waiting for the drain.
    fn finish_close(&self) {
        let mut lifecycle = self.lifecycle.write();
        if lifecycle.state == ManagerState::Closing {
            self.signal_drained(lifecycle.epoch);
            lifecycle.state = ManagerState::Closed;
            info!("lock manager closed");
        }
    }
}
