//! Regions: the ownership unit objects are grouped into, and the per-thread lock stack used to
//! acquire and release access to them.

use crate::error::{Error, Result};
use crate::ids::{RegionId, ThreadId};
use crate::monitor::{Monitor, WaitSlot};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

/// Id of the singleton read-only region: any thread may read objects here; writes are always
/// denied.
pub const READ_ONLY_REGION: RegionId = 1;
/// Id of the singleton protected region: any thread may read; writes require the object to be
/// migrated out first (see [`crate::migration`]).
pub const PROTECTED_REGION: RegionId = 2;
/// Id of the singleton limbo region: the transient home of an object in flight across a channel.
/// Ordinary code never locks it directly.
pub const LIMBO_REGION: RegionId = 3;

const FIRST_DYNAMIC_REGION: RegionId = 4;
static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(FIRST_DYNAMIC_REGION);

/// The access mode an entry on a thread's region-lock stack was acquired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Implemented by values that live inside a region and can be migrated between regions.
///
/// Objects carry their own region pointer directly (the design notes call for a field on the
/// object header rather than a region-to-object back-pointer table), so this trait is the
/// kernel's only way to read or rewrite it.
pub trait RegionObject: Send + Sync {
    /// The region this object is currently associated with. `None` means the public region.
    fn region(&self) -> Option<RegionId>;

    /// Reassigns this object's region pointer. Only migration and channel transfer call this,
    /// and both guarantee the whole reachable set is updated together.
    fn set_region(&self, region: Option<RegionId>);

    /// Objects directly reachable from this one, for the purposes of `reachable`/migration.
    fn children(&self) -> Vec<Arc<dyn RegionObject>>;

    /// Builds a new object with this one's own (non-region) state but `children` as its children
    /// list. Used by [`crate::migration::clone_reachable`]/[`crate::migration::clone_delimited`]
    /// to reconstruct an isomorphic graph without the kernel knowing each object's concrete shape.
    /// The clone starts out unregioned (`region() == None`); the caller assigns its final region.
    fn clone_shallow(&self, children: Vec<Arc<dyn RegionObject>>) -> Arc<dyn RegionObject>;
}

/// `REGION_OF(obj)`: the region an object currently belongs to.
#[must_use]
pub fn region_of(object: &Arc<dyn RegionObject>) -> Option<RegionId> {
    object.region()
}

/// An ownership unit grouping objects that share access-control rules.
///
/// `fixed_owner` regions (thread-private `current_region`s) grant access to their owning thread
/// only -- there is nothing to block on, so an attempt by another thread fails immediately rather
/// than waiting forever. Non-fixed ("shared") regions use an ordinary reader/writer lock built on
/// [`Monitor`], open to any thread.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    name: StdRwLock<Option<String>>,
    fixed_owner: bool,
    owner: StdRwLock<Option<ThreadId>>,
    alt_owner: StdRwLock<Option<ThreadId>>,
    autolock: AtomicBool,
    monitor: Monitor,
    readers: AtomicUsize,
    writer: AtomicBool,
}

impl Region {
    fn new(id: RegionId, name: Option<String>, fixed_owner: bool, owner: Option<ThreadId>) -> Self {
        Self {
            id,
            name: StdRwLock::new(name),
            fixed_owner,
            owner: StdRwLock::new(owner),
            alt_owner: StdRwLock::new(None),
            autolock: AtomicBool::new(false),
            monitor: Monitor::new(),
            readers: AtomicUsize::new(0),
            writer: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.name.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(name.into());
    }

    pub fn clear_name(&self) {
        *self.name.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn is_autolock(&self) -> bool {
        self.autolock.load(Ordering::Relaxed)
    }

    pub fn set_autolock(&self, autolock: bool) {
        self.autolock.store(autolock, Ordering::Relaxed);
    }

    /// `true` for thread-private regions (e.g. a thread's `current_region`): only the owning
    /// thread may lock them, and doing so never blocks.
    #[must_use]
    pub fn is_thread_local(&self) -> bool {
        self.fixed_owner
    }

    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_owner(&self, owner: Option<ThreadId>) {
        *self.owner.write().unwrap_or_else(std::sync::PoisonError::into_inner) = owner;
    }

    #[must_use]
    pub fn have_read_access(&self, thread: ThreadId) -> bool {
        if self.fixed_owner {
            self.owner() == Some(thread)
        } else {
            true
        }
    }

    #[must_use]
    pub fn have_write_access(&self, thread: ThreadId) -> bool {
        if self.fixed_owner {
            self.owner() == Some(thread)
        } else {
            true
        }
    }

    /// Blocking acquisition in `mode`.
    ///
    /// # Errors
    /// if this is a thread-local region owned by a different thread (acquiring would block
    /// forever since only the owner may ever release it).
    pub fn lock(&self, thread: ThreadId, mode: LockMode) -> Result<()> {
        if self.fixed_owner {
            return if self.owner() == Some(thread) {
                Ok(())
            } else {
                Err(Error::AccessDenied(format!(
                    "region {} is thread-local and not owned by the calling thread",
                    self.id
                )))
            };
        }

        self.monitor.lock(thread);
        loop {
            let blocked = match mode {
                LockMode::Write => self.writer.load(Ordering::Acquire) || self.readers.load(Ordering::Acquire) > 0,
                LockMode::Read => self.writer.load(Ordering::Acquire),
            };
            if !blocked {
                break;
            }
            let slot = Arc::new(WaitSlot::new());
            self.monitor.wait(thread, &slot)?;
        }
        match mode {
            LockMode::Write => self.writer.store(true, Ordering::Release),
            LockMode::Read => {
                self.readers.fetch_add(1, Ordering::AcqRel);
                // chain release: a writer's unlock only wakes the FIFO-first waiter, so this newly
                // admitted reader must wake the next one itself for readers to run concurrently.
                self.monitor.signal(thread)?;
            }
        }
        self.monitor.unlock(thread)?;
        Ok(())
    }

    /// Non-blocking acquisition in `mode`. Returns `false` instead of waiting.
    ///
    /// # Errors
    /// if this is a thread-local region owned by a different thread.
    pub fn try_lock(&self, thread: ThreadId, mode: LockMode) -> Result<bool> {
        if self.fixed_owner {
            return if self.owner() == Some(thread) {
                Ok(true)
            } else {
                Err(Error::AccessDenied(format!(
                    "region {} is thread-local and not owned by the calling thread",
                    self.id
                )))
            };
        }

        self.monitor.lock(thread);
        let blocked = match mode {
            LockMode::Write => self.writer.load(Ordering::Acquire) || self.readers.load(Ordering::Acquire) > 0,
            LockMode::Read => self.writer.load(Ordering::Acquire),
        };
        if blocked {
            self.monitor.unlock(thread)?;
            return Ok(false);
        }
        match mode {
            LockMode::Write => self.writer.store(true, Ordering::Release),
            LockMode::Read => {
                self.readers.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.monitor.unlock(thread)?;
        Ok(true)
    }

    /// Releases one acquisition in `mode`. Thread-local regions have nothing to release.
    ///
    /// # Errors
    /// if releasing a shared region's monitor fails (poisoned state).
    pub fn unlock(&self, thread: ThreadId, mode: LockMode) -> Result<()> {
        if self.fixed_owner {
            return Ok(());
        }
        self.monitor.lock(thread);
        match mode {
            LockMode::Write => {
                self.writer.store(false, Ordering::Release);
                self.monitor.signal(thread)?;
            }
            LockMode::Read => {
                if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    // Chain-release: wake one more waiter, who (if also a reader) will release
                    // the next when it re-acquires and unlocks in turn.
                    self.monitor.signal(thread)?;
                }
            }
        }
        self.monitor.unlock(thread)?;
        Ok(())
    }
}

/// Registry of dynamically created regions, keyed by [`RegionId`].
///
/// The three singleton regions ([`READ_ONLY_REGION`], [`PROTECTED_REGION`], [`LIMBO_REGION`])
/// are not stored here: they have fixed, global semantics rather than per-instance state.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: DashMap<RegionId, Arc<Region>>,
}

impl RegionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, empty region.
    pub fn new_region(
        &self,
        name: Option<String>,
        fixed_owner: bool,
        owner: Option<ThreadId>,
    ) -> Arc<Region> {
        let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(Region::new(id, name, fixed_owner, owner));
        self.regions.insert(id, Arc::clone(&region));
        region
    }

    #[must_use]
    pub fn get(&self, id: RegionId) -> Option<Arc<Region>> {
        self.regions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn is_read_only(id: RegionId) -> bool {
        id == READ_ONLY_REGION
    }

    #[must_use]
    pub fn is_protected(id: RegionId) -> bool {
        id == PROTECTED_REGION
    }

    #[must_use]
    pub fn is_limbo(id: RegionId) -> bool {
        id == LIMBO_REGION
    }
}

/// Identity-hashed per-object monitors: `HASH_LOCK`/`HASH_LOCK_SHARED` and the scoped
/// `synchronized` helpers built on them, for code that wants to lock on an individual object
/// rather than its whole region.
///
/// Keyed by the object's `Arc` pointer identity rather than the region table, so it works just as
/// well for public-region objects (which have no region of their own to lock). Entries are never
/// removed: a live `Arc<dyn RegionObject>` can always be hash-locked again later, and the
/// alternative (reference-counting table entries down to zero) would race the very lock it
/// protects.
#[derive(Debug, Default)]
pub struct HashLockTable {
    monitors: DashMap<usize, Arc<Monitor>>,
}

impl HashLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn monitor_for(&self, object: &Arc<dyn RegionObject>) -> Arc<Monitor> {
        let key = Arc::as_ptr(object).cast::<()>() as usize;
        Arc::clone(self.monitors.entry(key).or_insert_with(|| Arc::new(Monitor::new())).value())
    }

    /// Acquires the object's hash lock exclusively, blocking until available.
    pub fn hash_lock(&self, object: &Arc<dyn RegionObject>, thread: ThreadId) {
        self.monitor_for(object).lock(thread);
    }

    /// Releases one level of an exclusive hash lock.
    ///
    /// # Errors
    /// if `thread` does not hold it.
    pub fn hash_unlock(&self, object: &Arc<dyn RegionObject>, thread: ThreadId) -> Result<()> {
        self.monitor_for(object).unlock(thread)
    }

    /// Shared hash locks reuse the same per-object monitor as the exclusive form: this kernel's
    /// `Monitor` is a mutex, not a reader/writer lock, so "shared" acquisition here just means
    /// "participates in the same mutual exclusion" rather than allowing concurrent readers.
    pub fn hash_lock_shared(&self, object: &Arc<dyn RegionObject>, thread: ThreadId) {
        self.hash_lock(object, thread);
    }

    /// # Errors
    /// if `thread` does not hold it.
    pub fn hash_unlock_shared(&self, object: &Arc<dyn RegionObject>, thread: ThreadId) -> Result<()> {
        self.hash_unlock(object, thread)
    }

    /// Runs `body` with `object`'s hash lock held exclusively, always releasing it afterward even
    /// if `body` returns an error.
    ///
    /// # Errors
    /// whatever `body` returns, or the release itself failing.
    pub fn synchronized<R>(
        &self,
        object: &Arc<dyn RegionObject>,
        thread: ThreadId,
        body: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        self.hash_lock(object, thread);
        let result = body();
        self.hash_unlock(object, thread)?;
        result
    }

    /// `synchronized`'s shared-mode counterpart.
    ///
    /// # Errors
    /// see [`HashLockTable::synchronized`].
    pub fn synchronized_shared<R>(
        &self,
        object: &Arc<dyn RegionObject>,
        thread: ThreadId,
        body: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        self.hash_lock_shared(object, thread);
        let result = body();
        self.hash_unlock_shared(object, thread)?;
        result
    }
}

/// `true` for the public region (`None`), which allows concurrent read and write by any thread.
#[must_use]
pub fn is_public(region: Option<RegionId>) -> bool {
    region.is_none()
}

/// `true` if `region` is shared (readable/writable by more than just one fixed owner): the
/// public region or a non-fixed dynamic region.
#[must_use]
pub fn is_shared(region: Option<RegionId>, table: &RegionTable) -> bool {
    match region {
        None => true,
        Some(id) if RegionTable::is_read_only(id) || RegionTable::is_protected(id) => true,
        Some(id) => table.get(id).is_some_and(|region| !region.is_thread_local()),
    }
}

/// Per-thread ordered record of acquired region locks.
///
/// Not thread-shared: each [`crate::thread::ThreadRecord`] owns one. Top-of-stack locks are
/// released first, matching scoped acquisition via [`LockStack::pop_region_locks`].
#[derive(Debug, Default)]
pub struct LockStack {
    entries: Vec<(Arc<Region>, LockMode)>,
}

impl LockStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stack pointer: the number of locks currently held. Callers save this before
    /// `lock_objects` and pass it to `pop_region_locks` to release back to that point.
    #[must_use]
    pub fn stack_pointer(&self) -> usize {
        self.entries.len()
    }

    /// Locks every distinct, lockable region among `objects`, each in the mode paired with it,
    /// sorted by region identity to avoid deadlock against concurrent multi-region acquisitions.
    /// Objects in the public region, the thread's `current_region`, or already represented on the
    /// stack are skipped. On any failure, every lock newly acquired by this call is rolled back
    /// and the whole call fails.
    ///
    /// # Errors
    /// if any required region is thread-local and owned by another thread.
    pub fn lock_objects(
        &mut self,
        thread: ThreadId,
        current_region: Option<RegionId>,
        objects: &[(&Arc<dyn RegionObject>, LockMode)],
        table: &RegionTable,
    ) -> Result<usize> {
        let sp = self.stack_pointer();
        let mut needed: Vec<(Arc<Region>, LockMode)> = Vec::new();
        for (object, mode) in objects {
            let Some(region_id) = object.region() else {
                continue; // public: no lock needed
            };
            if Some(region_id) == current_region {
                continue;
            }
            if RegionTable::is_limbo(region_id) {
                return Err(Error::AccessDenied(
                    "objects in the limbo region cannot be locked directly".to_string(),
                ));
            }
            if RegionTable::is_read_only(region_id) {
                if *mode == LockMode::Write {
                    return Err(Error::AccessDenied(
                        "the read-only region cannot be write-locked".to_string(),
                    ));
                }
                continue; // reads always succeed, nothing to lock
            }
            if RegionTable::is_protected(region_id) {
                if *mode == LockMode::Write {
                    return Err(Error::AccessDenied(
                        "the protected region cannot be write-locked directly".to_string(),
                    ));
                }
                continue;
            }
            let Some(region) = table.get(region_id) else {
                return Err(Error::ArgumentError(format!(
                    "region {region_id} does not exist"
                )));
            };
            if let Some(existing) = needed.iter_mut().find(|(r, _)| r.id() == region.id()) {
                if *mode == LockMode::Write {
                    existing.1 = LockMode::Write;
                }
                continue;
            }
            needed.push((region, *mode));
        }
        needed.sort_by_key(|(region, _)| region.id());

        let mut acquired = Vec::with_capacity(needed.len());
        for (region, mode) in needed {
            if let Err(error) = region.lock(thread, mode) {
                for (region, mode) in acquired.into_iter().rev() {
                    let _: Result<()> = Region::unlock(&region, thread, mode);
                }
                return Err(error);
            }
            acquired.push((region, mode));
        }

        self.entries.extend(acquired);
        Ok(sp)
    }

    /// Non-blocking variant of [`LockStack::lock_objects`]: fails immediately (without rollback
    /// of anything but its own attempt) if any needed region is unavailable.
    ///
    /// # Errors
    /// if a required region is thread-local and owned elsewhere, or any lock is currently held in
    /// a conflicting mode.
    pub fn try_lock_objects(
        &mut self,
        thread: ThreadId,
        current_region: Option<RegionId>,
        objects: &[(&Arc<dyn RegionObject>, LockMode)],
        table: &RegionTable,
    ) -> Result<usize> {
        let sp = self.stack_pointer();
        let mut needed: Vec<(Arc<Region>, LockMode)> = Vec::new();
        for (object, mode) in objects {
            let Some(region_id) = object.region() else {
                continue;
            };
            if Some(region_id) == current_region {
                continue;
            }
            if RegionTable::is_limbo(region_id) {
                return Err(Error::AccessDenied(
                    "objects in the limbo region cannot be locked directly".to_string(),
                ));
            }
            if RegionTable::is_read_only(region_id) || RegionTable::is_protected(region_id) {
                if *mode == LockMode::Write {
                    return Err(Error::AccessDenied(
                        "this sentinel region cannot be write-locked".to_string(),
                    ));
                }
                continue;
            }
            let Some(region) = table.get(region_id) else {
                return Err(Error::ArgumentError(format!(
                    "region {region_id} does not exist"
                )));
            };
            if let Some(existing) = needed.iter_mut().find(|(r, _)| r.id() == region.id()) {
                if *mode == LockMode::Write {
                    existing.1 = LockMode::Write;
                }
                continue;
            }
            needed.push((region, *mode));
        }
        needed.sort_by_key(|(region, _)| region.id());

        let mut acquired = Vec::with_capacity(needed.len());
        for (region, mode) in needed {
            match region.try_lock(thread, mode) {
                Ok(true) => acquired.push((region, mode)),
                Ok(false) => {
                    for (region, mode) in acquired.into_iter().rev() {
                        let _: Result<()> = Region::unlock(&region, thread, mode);
                    }
                    return Err(Error::AccessDenied(
                        "a required region lock was unavailable".to_string(),
                    ));
                }
                Err(error) => {
                    for (region, mode) in acquired.into_iter().rev() {
                        let _: Result<()> = Region::unlock(&region, thread, mode);
                    }
                    return Err(error);
                }
            }
        }

        self.entries.extend(acquired);
        Ok(sp)
    }

    /// Releases every lock above `sp`, in reverse acquisition order.
    ///
    /// # Errors
    /// if releasing any region's lock fails.
    pub fn pop_region_locks(&mut self, thread: ThreadId, sp: usize) -> Result<()> {
        while self.entries.len() > sp {
            let Some((region, mode)) = self.entries.pop() else {
                break;
            };
            region.unlock(thread, mode)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_locked(&self, region_id: RegionId) -> bool {
        self.entries.iter().any(|(region, _)| region.id() == region_id)
    }

    #[must_use]
    pub fn current_locks(&self) -> Vec<(RegionId, LockMode)> {
        self.entries.iter().map(|(region, mode)| (region.id(), *mode)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_local_region_denies_other_threads() {
        let table = RegionTable::new();
        let region = table.new_region(None, true, Some(1));
        assert!(region.lock(1, LockMode::Write).is_ok());
        region.unlock(1, LockMode::Write).expect("owner releases");
        assert!(region.lock(2, LockMode::Read).is_err());
    }

    #[test]
    fn shared_region_allows_multiple_readers() {
        let table = RegionTable::new();
        let region = table.new_region(None, false, None);
        assert!(region.lock(1, LockMode::Read).is_ok());
        assert!(region.try_lock(2, LockMode::Read).expect("no thread-local error").is_ok());
        assert!(!region.try_lock(3, LockMode::Write).expect("no thread-local error"));
    }

    #[test]
    fn lock_stack_pops_in_reverse_order() {
        let table = RegionTable::new();
        let a: Arc<dyn RegionObject> = Arc::new(TestObject::new(Some(table.new_region(None, false, None).id())));
        let b: Arc<dyn RegionObject> = Arc::new(TestObject::new(Some(table.new_region(None, false, None).id())));

        let mut stack = LockStack::new();
        let sp = stack
            .lock_objects(1, None, &[(&a, LockMode::Read), (&b, LockMode::Write)], &table)
            .expect("both lockable");
        assert_eq!(stack.current_locks().len(), 2);
        stack.pop_region_locks(1, sp).expect("releases cleanly");
        assert_eq!(stack.current_locks().len(), 0);
    }

    struct TestObject {
        region: std::sync::Mutex<Option<RegionId>>,
    }

    impl TestObject {
        fn new(region: Option<RegionId>) -> Self {
            Self {
                region: std::sync::Mutex::new(region),
            }
        }
    }

    impl RegionObject for TestObject {
        fn region(&self) -> Option<RegionId> {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        fn set_region(&self, region: Option<RegionId>) {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = region;
        }

        fn children(&self) -> Vec<Arc<dyn RegionObject>> {
            Vec::new()
        }

        fn clone_shallow(&self, _children: Vec<Arc<dyn RegionObject>>) -> Arc<dyn RegionObject> {
            Arc::new(TestObject::new(None))
        }
    }
}
