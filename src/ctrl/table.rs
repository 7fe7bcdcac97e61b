//! # Lock Table
//!
//! Two levels of reader/writer locks protect the state of the lock manager:
//!
//! 1. Every [`LockTable`] shard maps resource names to their [`LockResource`] entries. Its lock is
//!    only held for the lookup (read) or the insertion/removal (write) of an entry.
//! 2. Every [`LockResource`] has its own lock, which guards the granted list, the waiting queue
//!    and the aggregate granted mode of that one resource.
//!
//! Locks are always taken in that order (shard, then resource). The shard lock is released as
//! soon as the resource lock is held, so requests piling up on one resource never block lookups
//! of any other resource.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::{RawRwLock, RwLock, RwLockWriteGuard, lock_api::ArcRwLockWriteGuard};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    base::OwnerId,
    ctrl::{LockMode, request::LockRequest},
};

/// An owned write lock on a single [`LockResource`].
pub(crate) type ResourceGuard = ArcRwLockWriteGuard<RawRwLock, LockResource>;

type Shard = RwLock<HashMap<Arc<str>, Arc<RwLock<LockResource>>>>;

/// Per-resource lock state.
#[derive(Debug)]
pub(crate) struct LockResource {
    name: Arc<str>,
    /// Aggregate of all granted modes, folded with [`LockMode::max`].
    pub(crate) granted_mode: LockMode,
    pub(crate) granted: Vec<Arc<LockRequest>>,
    /// Pending requests, oldest first. Upgrades are queued ahead of all other requests, but
    /// behind earlier upgrades.
    pub(crate) waiting: VecDeque<Arc<LockRequest>>,
}

/// Where an owner stands on a resource.
pub(crate) enum Holding<'a> {
    /// The owner does not hold anything on the resource.
    Nothing,
    /// The owner already holds the requested mode.
    SameMode(&'a Arc<LockRequest>),
    /// The owner holds the resource, but in other modes only.
    OtherMode,
}

impl LockResource {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            granted_mode: LockMode::Free,
            granted: Vec::new(),
            waiting: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Looks for granted requests of `owner`, preferring one in exactly `mode`.
    pub(crate) fn holding(&self, owner: &OwnerId, mode: LockMode) -> Holding<'_> {
        let mut holding = Holding::Nothing;
        for request in self.granted.iter().filter(|r| r.owner() == owner) {
            if request.mode() == mode {
                return Holding::SameMode(request);
            }
            holding = Holding::OtherMode;
        }
        holding
    }

    /// Returns `true` when every granted request belongs to a single owner. With `Some(owner)`,
    /// that single owner also has to be `owner`.
    pub(crate) fn is_single_owner(&self, owner: Option<&OwnerId>) -> bool {
        let Some(first) = self.granted.first() else {
            return false;
        };
        let owner = owner.unwrap_or(first.owner());
        self.granted.iter().all(|r| r.owner() == owner)
    }

    /// Adds an already granted request and folds its mode into the aggregate.
    pub(crate) fn push_granted(&mut self, request: Arc<LockRequest>) {
        self.granted_mode = self.granted_mode.max(request.mode());
        self.granted.push(request);
    }

    pub(crate) fn is_granted(&self, request: &Arc<LockRequest>) -> bool {
        self.granted.iter().any(|r| Arc::ptr_eq(r, request))
    }

    /// Removes a granted request. The aggregate mode is left untouched and has to be recomputed.
    pub(crate) fn remove_granted(&mut self, request: &Arc<LockRequest>) -> bool {
        match self.granted.iter().position(|r| Arc::ptr_eq(r, request)) {
            Some(index) => {
                self.granted.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Queues a pending request, respecting upgrade priority.
    pub(crate) fn enqueue(&mut self, request: Arc<LockRequest>) {
        if !request.is_upgrade() {
            self.waiting.push_back(request);
            return;
        }
        let index = self
            .waiting
            .iter()
            .position(|r| !r.is_upgrade())
            .unwrap_or(self.waiting.len());
        self.waiting.insert(index, request);
    }

    /// Removes a pending request from the queue and returns the position it had.
    pub(crate) fn dequeue(&mut self, request: &Arc<LockRequest>) -> Option<usize> {
        let index = self.waiting.iter().position(|r| Arc::ptr_eq(r, request))?;
        self.waiting.remove(index);
        Some(index)
    }

    /// Checks that the aggregate mode matches the granted list, and that granted requests of
    /// different owners are pairwise compatible.
    pub(crate) fn is_consistent(&self) -> bool {
        let aggregate = self
            .granted
            .iter()
            .fold(LockMode::Free, |mode, r| mode.max(r.mode()));
        aggregate == self.granted_mode
            && self.granted.iter().enumerate().all(|(i, a)| {
                self.granted[i + 1..]
                    .iter()
                    .all(|b| a.owner() == b.owner() || b.mode().is_compatible_with(a.mode()))
            })
    }

    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }

    pub(crate) fn snapshot(&self) -> LockResourceSnapshot {
        let entry = |r: &Arc<LockRequest>| LockEntrySnapshot {
            owner: r.owner().clone(),
            mode: r.mode(),
            lock_count: r.lock_count(),
            is_upgrade: r.is_upgrade(),
        };
        LockResourceSnapshot {
            name: self.name.to_string(),
            granted_mode: self.granted_mode,
            granted: self.granted.iter().map(entry).collect(),
            waiting: self.waiting.iter().map(entry).collect(),
        }
    }
}

/// Point-in-time copy of the lock state of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResourceSnapshot {
    pub name: String,
    pub granted_mode: LockMode,
    /// Granted requests, in no particular order.
    pub granted: Vec<LockEntrySnapshot>,
    /// Pending requests, in promotion order.
    pub waiting: Vec<LockEntrySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntrySnapshot {
    pub owner: OwnerId,
    pub mode: LockMode,
    pub lock_count: u32,
    pub is_upgrade: bool,
}

/// Outcome of [`LockTable::enter`].
pub(crate) enum Entered {
    /// The lock manager does not accept requests.
    Rejected,
    Locked(ResourceGuard),
}

/// Maps resource names to their lock state, split into independently locked shards.
#[derive(Debug)]
pub(crate) struct LockTable {
    shards: Box<[Shard]>,
    /// Number of entries across all shards.
    len: AtomicUsize,
}

impl LockTable {
    pub(crate) fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard(&self, name: &str) -> &Shard {
        let index = xxh3_64(name.as_bytes()) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    /// Number of resources that currently have an entry.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Write-locks the entry of `name`, creating it if needed.
    ///
    /// `accepting` is checked under the shard lock, which the close path holds exclusively when
    /// it flips the flag. No request can therefore slip into a resource after close has scanned
    /// it.
    pub(crate) fn enter(&self, name: &str, accepting: &AtomicBool) -> Entered {
        let shard = self.shard(name);
        {
            let entries = shard.read();
            if !accepting.load(Ordering::Acquire) {
                return Entered::Rejected;
            }
            if let Some(resource) = entries.get(name) {
                // entry exists, lock it by reference (cheap, frequent)
                return Entered::Locked(resource.write_arc());
            }
        }

        // entry not inserted yet, retry under the write lock (expensive, rare)
        let mut entries = shard.write();
        if !accepting.load(Ordering::Acquire) {
            return Entered::Rejected;
        }
        let resource = entries.entry(Arc::from(name)).or_insert_with_key(|key| {
            self.len.fetch_add(1, Ordering::AcqRel);
            Arc::new(RwLock::new(LockResource::new(key.clone())))
        });
        Entered::Locked(resource.write_arc())
    }

    /// Write-locks the entry of `name`, if there is one.
    pub(crate) fn find(&self, name: &str) -> Option<ResourceGuard> {
        let entries = self.shard(name).read();
        entries.get(name).map(|resource| resource.write_arc())
    }

    pub(crate) fn snapshot(&self, name: &str) -> Option<LockResourceSnapshot> {
        let entries = self.shard(name).read();
        entries.get(name).map(|resource| resource.read().snapshot())
    }

    /// Removes the entry of `name`, if it is still idle. A request may have recreated or reused
    /// the entry in the meantime, in which case it is kept.
    pub(crate) fn remove_if_idle(&self, name: &str) -> bool {
        let mut entries = self.shard(name).write();
        let idle = entries
            .get(name)
            .is_some_and(|resource| resource.read().is_idle());
        if idle {
            entries.remove(name);
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        idle
    }

    /// Write-locks every shard, in index order.
    pub(crate) fn write_all(&self) -> TableWriteGuard<'_> {
        TableWriteGuard {
            table: self,
            shards: self.shards.iter().map(|shard| shard.write()).collect(),
        }
    }
}

/// Exclusive access to the whole [`LockTable`].
pub(crate) struct TableWriteGuard<'a> {
    table: &'a LockTable,
    shards: Vec<RwLockWriteGuard<'a, HashMap<Arc<str>, Arc<RwLock<LockResource>>>>>,
}

impl TableWriteGuard<'_> {
    pub(crate) fn resources(&self) -> impl Iterator<Item = &Arc<RwLock<LockResource>>> {
        self.shards.iter().flat_map(|entries| entries.values())
    }

    /// Removes every idle entry and returns how many entries are left.
    pub(crate) fn remove_idle(&mut self) -> usize {
        let mut removed = 0;
        for entries in self.shards.iter_mut() {
            entries.retain(|_, resource| {
                let idle = resource.read().is_idle();
                removed += idle as usize;
                !idle
            });
        }
        let previous = self.table.len.fetch_sub(removed, Ordering::AcqRel);
        previous - removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::LockTimeout;

    fn request(owner: &str, mode: LockMode, is_upgrade: bool) -> Arc<LockRequest> {
        Arc::new(LockRequest::new(
            0,
            OwnerId::from(owner),
            Arc::from("/tbl"),
            mode,
            LockTimeout::Infinite,
            is_upgrade,
        ))
    }

    #[test]
    fn test_enqueue_upgrades_ahead_of_waiters() {
        let mut resource = LockResource::new(Arc::from("/tbl"));
        resource.enqueue(request("a", LockMode::Shared, false));
        resource.enqueue(request("b", LockMode::Exclusive, true));
        resource.enqueue(request("c", LockMode::Update, false));
        resource.enqueue(request("d", LockMode::Exclusive, true));

        let order = resource
            .waiting
            .iter()
            .map(|r| r.owner().as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, ["b", "d", "a", "c"]);
    }

    #[test]
    fn test_holding_prefers_same_mode() {
        let mut resource = LockResource::new(Arc::from("/tbl"));
        let shared = request("a", LockMode::Shared, false);
        let exclusive = request("a", LockMode::Exclusive, false);
        resource.push_granted(shared);
        resource.push_granted(exclusive.clone());

        let owner = OwnerId::from("a");
        assert!(matches!(
            resource.holding(&owner, LockMode::Exclusive),
            Holding::SameMode(r) if Arc::ptr_eq(r, &exclusive)
        ));
        assert!(matches!(
            resource.holding(&owner, LockMode::Update),
            Holding::OtherMode
        ));
        assert!(matches!(
            resource.holding(&OwnerId::from("b"), LockMode::Shared),
            Holding::Nothing
        ));
        assert_eq!(resource.granted_mode, LockMode::Exclusive);
    }

    #[test]
    fn test_consistency_check() {
        let mut resource = LockResource::new(Arc::from("/tbl"));
        resource.push_granted(request("a", LockMode::IntentShared, false));
        resource.push_granted(request("b", LockMode::IntentExclusive, false));
        assert!(resource.is_consistent());

        // one owner may hold conflicting modes
        resource.push_granted(request("b", LockMode::SharedIntentExclusive, false));
        assert!(resource.is_consistent());

        resource.push_granted(request("c", LockMode::Exclusive, false));
        assert!(!resource.is_consistent());

        resource.granted.pop();
        resource.granted_mode = LockMode::Free;
        assert!(!resource.is_consistent());
    }

    #[test]
    fn test_single_owner() {
        let mut resource = LockResource::new(Arc::from("/tbl"));
        assert!(!resource.is_single_owner(None));

        resource.push_granted(request("a", LockMode::IntentShared, false));
        resource.push_granted(request("a", LockMode::Shared, false));
        assert!(resource.is_single_owner(None));
        assert!(resource.is_single_owner(Some(&OwnerId::from("a"))));
        assert!(!resource.is_single_owner(Some(&OwnerId::from("b"))));

        resource.push_granted(request("b", LockMode::IntentShared, false));
        assert!(!resource.is_single_owner(None));
    }

    #[test]
    fn test_dequeue_reports_position() {
        let mut resource = LockResource::new(Arc::from("/tbl"));
        let first = request("a", LockMode::Exclusive, false);
        let second = request("b", LockMode::Exclusive, false);
        resource.enqueue(first.clone());
        resource.enqueue(second.clone());

        assert_eq!(resource.dequeue(&second), Some(1));
        assert_eq!(resource.dequeue(&second), None);
        assert_eq!(resource.dequeue(&first), Some(0));
        assert!(resource.is_idle());
    }

    #[test]
    fn test_table_enter_and_cleanup() {
        let table = LockTable::new(4);
        let accepting = AtomicBool::new(true);

        let Entered::Locked(mut guard) = table.enter("/tbl", &accepting) else {
            panic!("table should accept requests");
        };
        assert_eq!(guard.name().as_ref(), "/tbl");
        guard.push_granted(request("a", LockMode::Shared, false));
        drop(guard);
        assert_eq!(table.len(), 1);

        // busy entries survive cleanup
        assert!(!table.remove_if_idle("/tbl"));

        let mut guard = table.find("/tbl").expect("entry should exist");
        guard.granted.clear();
        drop(guard);
        assert!(table.remove_if_idle("/tbl"));
        assert_eq!(table.len(), 0);
        assert!(table.find("/tbl").is_none());
    }

    #[test]
    fn test_table_rejects_when_not_accepting() {
        let table = LockTable::new(1);
        let accepting = AtomicBool::new(false);
        assert!(matches!(
            table.enter("/tbl", &accepting),
            Entered::Rejected
        ));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_write_all_removes_idle_entries() {
        let table = LockTable::new(3);
        let accepting = AtomicBool::new(true);
        for name in ["/a", "/b", "/c"] {
            let Entered::Locked(mut guard) = table.enter(name, &accepting) else {
                unreachable!();
            };
            if name == "/b" {
                guard.push_granted(request("a", LockMode::Shared, false));
            }
        }
        assert_eq!(table.len(), 3);

        let mut all = table.write_all();
        assert_eq!(all.resources().count(), 3);
        assert_eq!(all.remove_idle(), 1);
        drop(all);
        assert!(table.snapshot("/b").is_some());
        assert!(table.snapshot("/a").is_none());
    }
}
