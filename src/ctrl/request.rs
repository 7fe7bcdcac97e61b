//! # Lock Requests
//!
//! A [`LockRequest`] is the unit of work of the lock manager: one owner asking for one resource
//! in one mode. The same record is shared between the lock manager, which keeps it in the granted
//! list or the waiting queue of its resource, and the caller, which holds it as a [`LockHandle`].
//!
//! ## Status Transitions
//!
//! ```not_rust
//!  Invalid ---> Pending ---> Granted
//!     |            |
//!     |            +-------> Timeout
//!     |
//!     +-------> Granted | Timeout   (resolved right away)
//! ```
//!
//! Leaving `Pending` is claimed with a compare-and-swap on the status byte, so when a grant and an
//! expiration race, exactly one of them wins and fulfills the completion channel. The other one
//! observes the lost claim and does nothing.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    base::{HlmError, HlmResult, OwnerId},
    ctrl::LockMode,
};

#[repr(u8)]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum LockStatus {
    /// Constructed, but not yet submitted to a lock manager.
    Invalid = 0,
    Pending = 1,
    Granted = 2,
    Timeout = 3,
}

impl LockStatus {
    /// Returns `true` for the statuses a request can never leave again.
    #[inline]
    pub const fn is_final(self) -> bool {
        matches!(self, LockStatus::Granted | LockStatus::Timeout)
    }
}

/// Result of releasing a [`LockHandle`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnlockStatus {
    Success,
    /// The handle is not in the granted list of its resource, e.g. it was never granted or has
    /// been released completely already.
    NotGranted,
    /// No lock exists on the resource of the handle.
    UnknownResource,
}

/// How long a request may wait in the queue before it times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTimeout {
    Infinite,
    After(Duration),
}

impl LockTimeout {
    /// Never wait: either grant right away or time out right away.
    pub const IMMEDIATE: Self = Self::After(Duration::ZERO);

    /// Sentinel for [`LockTimeout::Infinite`] in millisecond based APIs.
    pub const INFINITE_MILLIS: i64 = -1;

    /// Converts a millisecond timeout, where [`Self::INFINITE_MILLIS`] waits forever. Any other
    /// negative value is rejected.
    pub fn from_millis(millis: i64) -> HlmResult<Self> {
        match millis {
            Self::INFINITE_MILLIS => Ok(Self::Infinite),
            millis if millis < 0 => Err(HlmError::invalid_argument(
                "timeout",
                "must not be negative, unless infinite",
            )),
            millis => Ok(Self::After(Duration::from_millis(millis as u64))),
        }
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        matches!(self, Self::After(d) if d.is_zero())
    }

    #[inline]
    pub const fn duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for LockTimeout {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Option<Duration>> for LockTimeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Infinite, Self::After)
    }
}

/// The record behind a [`LockHandle`].
///
/// The immutable part describes the request. The mutable part (status, lock count, grant time,
/// waiter, expiration timer) is only ever written by the lock manager while it holds the write
/// lock of the resource, but may be read by the caller at any time.
pub(crate) struct LockRequest {
    /// Identifies the lock manager that created this record.
    manager_id: u64,
    owner: OwnerId,
    resource_name: Arc<str>,
    mode: LockMode,
    timeout: LockTimeout,
    /// Set when the owner already held another mode on the resource, that could not be changed
    /// in place. Upgrades are queued ahead of ordinary waiters.
    is_upgrade: bool,

    status: AtomicU8,
    /// How often the owner acquired this exact mode. Released at zero.
    lock_count: AtomicU32,
    grant_time: OnceLock<SystemTime>,
    /// Fulfilled once the request leaves [`LockStatus::Pending`].
    waiter: Mutex<Option<oneshot::Sender<LockStatus>>>,
    expiration: Mutex<Option<JoinHandle<()>>>,
}

impl LockRequest {
    pub(crate) fn new(
        manager_id: u64,
        owner: OwnerId,
        resource_name: Arc<str>,
        mode: LockMode,
        timeout: LockTimeout,
        is_upgrade: bool,
    ) -> Self {
        Self {
            manager_id,
            owner,
            resource_name,
            mode,
            timeout,
            is_upgrade,
            status: AtomicU8::new(LockStatus::Invalid.into()),
            lock_count: AtomicU32::new(0),
            grant_time: OnceLock::new(),
            waiter: Mutex::new(None),
            expiration: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn manager_id(&self) -> u64 {
        self.manager_id
    }

    #[inline]
    pub(crate) fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[inline]
    pub(crate) fn resource_name(&self) -> &Arc<str> {
        &self.resource_name
    }

    #[inline]
    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    pub(crate) fn timeout(&self) -> LockTimeout {
        self.timeout
    }

    #[inline]
    pub(crate) fn is_upgrade(&self) -> bool {
        self.is_upgrade
    }

    pub(crate) fn status(&self) -> LockStatus {
        LockStatus::try_from(self.status.load(Ordering::Acquire))
            .expect("status byte is only ever written from a LockStatus")
    }

    #[inline]
    pub(crate) fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn grant_time(&self) -> Option<SystemTime> {
        self.grant_time.get().copied()
    }

    /// Marks a fresh record as granted, without ever passing through the waiting queue.
    pub(crate) fn grant_now(&self) {
        debug_assert_eq!(self.status(), LockStatus::Invalid);
        self.status
            .store(LockStatus::Granted.into(), Ordering::Release);
        self.lock_count.store(1, Ordering::Release);
        let _ = self.grant_time.set(SystemTime::now());
    }

    /// Marks a fresh record as timed out. Used when it could not be granted and may not wait.
    pub(crate) fn time_out_now(&self) {
        debug_assert_eq!(self.status(), LockStatus::Invalid);
        self.status
            .store(LockStatus::Timeout.into(), Ordering::Release);
    }

    /// Marks a fresh record as pending and returns the receiving end of its completion channel.
    pub(crate) fn make_pending(&self) -> oneshot::Receiver<LockStatus> {
        debug_assert_eq!(self.status(), LockStatus::Invalid);
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock() = Some(tx);
        self.status
            .store(LockStatus::Pending.into(), Ordering::Release);
        rx
    }

    /// Counts one more acquisition of an already granted record by the same owner.
    pub(crate) fn add_reference(&self) -> u32 {
        self.lock_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one acquisition and returns the remaining count.
    pub(crate) fn remove_reference(&self) -> u32 {
        let previous = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released a lock request without references");
        previous - 1
    }

    /// Claims the transition out of [`LockStatus::Pending`]. Returns `false` if another path has
    /// already claimed it, in which case the caller must not touch the record any further.
    pub(crate) fn try_finish(&self, status: LockStatus) -> bool {
        debug_assert!(status.is_final());
        let claimed = self
            .status
            .compare_exchange(
                LockStatus::Pending.into(),
                status.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            match status {
                LockStatus::Granted => {
                    self.lock_count.store(1, Ordering::Release);
                    let _ = self.grant_time.set(SystemTime::now());
                }
                _ => self.lock_count.store(0, Ordering::Release),
            }
        }
        claimed
    }

    /// Fulfills the completion channel. Does nothing if it has been fulfilled before, or if the
    /// waiting side is already gone.
    pub(crate) fn complete(&self) {
        if let Some(tx) = self.waiter.lock().take() {
            let _ = tx.send(self.status());
        }
    }

    pub(crate) fn start_expire(&self, timer: JoinHandle<()>) {
        let previous = self.expiration.lock().replace(timer);
        debug_assert!(previous.is_none(), "expiration timer armed twice");
    }

    /// Cancels the expiration timer, if it is still armed. Returns `true` if a timer was
    /// cancelled.
    pub(crate) fn stop_expire(&self) -> bool {
        match self.expiration.lock().take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("owner", &self.owner)
            .field("resource", &self.resource_name)
            .field("mode", &self.mode)
            .field("status", &self.status())
            .field("count", &self.lock_count())
            .field("upgrade", &self.is_upgrade)
            .finish()
    }
}

/// A caller's view of a lock request.
///
/// Handles are cheap to clone, and all clones refer to the same request. Two handles are equal
/// only if they refer to the same request, regardless of owner, resource or mode.
#[derive(Clone)]
pub struct LockHandle(pub(crate) Arc<LockRequest>);

impl LockHandle {
    pub fn owner(&self) -> &OwnerId {
        self.0.owner()
    }

    pub fn resource_name(&self) -> &str {
        self.0.resource_name()
    }

    pub fn mode(&self) -> LockMode {
        self.0.mode()
    }

    pub fn timeout(&self) -> LockTimeout {
        self.0.timeout()
    }

    pub fn status(&self) -> LockStatus {
        self.0.status()
    }

    pub fn is_granted(&self) -> bool {
        self.status() == LockStatus::Granted
    }

    /// The time the request was granted, if it ever was.
    pub fn grant_time(&self) -> Option<SystemTime> {
        self.0.grant_time()
    }

    /// How many acquisitions of this mode by this owner are outstanding.
    pub fn lock_count(&self) -> u32 {
        self.0.lock_count()
    }

    pub fn is_upgrade(&self) -> bool {
        self.0.is_upgrade()
    }

    #[inline]
    pub(crate) fn request(&self) -> &Arc<LockRequest> {
        &self.0
    }
}

impl PartialEq for LockHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LockHandle {}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Resolves to the [`LockHandle`] of an acquisition, once it got granted or timed out.
///
/// Requests that could be decided right away resolve on the first poll. Dropping the waiter does
/// not withdraw a pending request: it stays queued until it is granted or expires.
#[must_use = "the lock handle is needed to release the lock again"]
pub struct LockWaiter {
    handle: LockHandle,
    rx: Option<oneshot::Receiver<LockStatus>>,
}

impl LockWaiter {
    pub(crate) fn ready(handle: LockHandle) -> Self {
        Self { handle, rx: None }
    }

    pub(crate) fn pending(handle: LockHandle, rx: oneshot::Receiver<LockStatus>) -> Self {
        Self {
            handle,
            rx: Some(rx),
        }
    }

    /// The current status of the underlying request, without waiting.
    pub fn status(&self) -> LockStatus {
        self.handle.status()
    }

    /// Returns `true` once awaiting this waiter will not block anymore.
    pub fn is_resolved(&self) -> bool {
        self.status().is_final()
    }

    /// The handle of the underlying request, which may still be pending.
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }
}

impl Future for LockWaiter {
    type Output = LockHandle;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(rx) = this.rx.as_mut() {
            match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(_status)) => {}
                Poll::Ready(Err(_closed)) => {
                    // NB: the lock manager dropped the request without deciding it, which only
                    // happens when the manager itself is dropped
                    if this.handle.0.try_finish(LockStatus::Timeout) {
                        this.handle.0.stop_expire();
                    }
                }
            }
            this.rx = None;
        }
        Poll::Ready(this.handle.clone())
    }
}

impl fmt::Debug for LockWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockWaiter")
            .field("handle", &self.handle)
            .field("resolved", &self.rx.is_none())
            .finish()
    }
}
