//! Object-graph migration between regions: `share`, `adopt`, `migrate`, and the
//! `make_public`/`make_read_only`/`make_protected` family built on top of them.
//!
//! Every `_norecurse` operation moves exactly the object named. Its recursive sibling first walks
//! [`reachable`] from that object and moves the whole set atomically: either every object's region
//! pointer is rewritten, or (on any validation failure) none are. This is what lets an object graph
//! cross a channel or be shared between threads without a deep copy.

use crate::error::{Error, Result};
use crate::ids::{RegionId, ThreadId};
use crate::region::{self, LockMode, Region, RegionTable};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Collects every object transitively reachable from `root` that sits in the same region as
/// `root` itself, stopping at any child that has crossed into a different region (including the
/// public/read-only/protected/limbo sentinels). The root is always included even if its own region
/// is a sentinel.
#[must_use]
pub fn reachable(root: &Arc<dyn region::RegionObject>) -> Vec<Arc<dyn region::RegionObject>> {
    let boundary = root.region();
    let mut seen: HashSet<*const ()> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<Arc<dyn region::RegionObject>> = vec![Arc::clone(root)];
    while let Some(object) = stack.pop() {
        let key = Arc::as_ptr(&object).cast::<()>();
        if !seen.insert(key) {
            continue;
        }
        order.push(Arc::clone(&object));
        for child in object.children() {
            if child.region() != boundary {
                continue;
            }
            stack.push(child);
        }
    }
    order
}

/// Every object transitively reachable from `root`, crossing region boundaries freely (unlike
/// [`reachable`]). Used by [`clone_reachable`], which clones the whole graph a root can see
/// regardless of which regions its parts currently sit in.
fn reachable_unbounded(root: &Arc<dyn region::RegionObject>) -> Vec<Arc<dyn region::RegionObject>> {
    let mut seen: HashSet<*const ()> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<Arc<dyn region::RegionObject>> = vec![Arc::clone(root)];
    while let Some(object) = stack.pop() {
        let key = Arc::as_ptr(&object).cast::<()>();
        if !seen.insert(key) {
            continue;
        }
        order.push(Arc::clone(&object));
        stack.extend(object.children());
    }
    order
}

/// Clones `root` and every object in `roots`, postorder so each clone is built from already-cloned
/// children, and returns the clone of `root`. Assigns the clone set to a new shared region.
///
/// # Errors
/// [`Error::ArgumentError`] if `roots` contains a cycle (this kernel's [`region::RegionObject`]
/// seam has no way to wire a clone's children after construction, so a clone set must be a DAG).
fn clone_set(root: &Arc<dyn region::RegionObject>, roots: &[Arc<dyn region::RegionObject>], thread: ThreadId, table: &RegionTable) -> Result<Arc<dyn region::RegionObject>> {
    let members: HashSet<*const ()> = roots.iter().map(|object| Arc::as_ptr(object).cast::<()>()).collect();
    let mut clones: HashMap<*const (), Arc<dyn region::RegionObject>> = HashMap::new();
    let mut visiting: HashSet<*const ()> = HashSet::new();

    fn clone_one(
        object: &Arc<dyn region::RegionObject>,
        members: &HashSet<*const ()>,
        clones: &mut HashMap<*const (), Arc<dyn region::RegionObject>>,
        visiting: &mut HashSet<*const ()>,
    ) -> Result<Arc<dyn region::RegionObject>> {
        let key = Arc::as_ptr(object).cast::<()>();
        if let Some(existing) = clones.get(&key) {
            return Ok(Arc::clone(existing));
        }
        if !members.contains(&key) {
            // outside the set being cloned: shared by reference, not cloned
            return Ok(Arc::clone(object));
        }
        if !visiting.insert(key) {
            return Err(Error::ArgumentError("clone_reachable/clone_delimited cannot clone a cyclic object graph".to_string()));
        }
        let mut cloned_children = Vec::with_capacity(object.children().len());
        for child in object.children() {
            cloned_children.push(clone_one(&child, members, clones, visiting)?);
        }
        let clone = object.clone_shallow(cloned_children);
        visiting.remove(&key);
        clones.insert(key, Arc::clone(&clone));
        Ok(clone)
    }

    let cloned_root = clone_one(root, &members, &mut clones, &mut visiting)?;
    let region = table.new_region(None, false, None);
    let cloned_objects: Vec<_> = clones.into_values().collect();
    set_region_all(&cloned_objects, Some(region.id()));
    let _ = thread; // no source locking needed: clones start out unregioned
    Ok(cloned_root)
}

/// Deep-clones the whole object graph transitively reachable from `root`, following children
/// across region boundaries. Returns the clone of `root`; the clone set lands in a new region.
///
/// # Errors
/// [`Error::ArgumentError`] if the graph is cyclic.
pub fn clone_reachable(root: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<Arc<dyn region::RegionObject>> {
    let roots = reachable_unbounded(root);
    clone_set(root, &roots, thread, table)
}

/// Deep-clones the region-bounded reachable set rooted at `root` (the same set [`reachable`]
/// computes: it stops at any child that has crossed into a different region). Returns the clone
/// of `root`; the clone set lands in a new region.
///
/// # Errors
/// [`Error::ArgumentError`] if the graph is cyclic.
pub fn clone_delimited(root: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<Arc<dyn region::RegionObject>> {
    let roots = reachable(root);
    clone_set(root, &roots, thread, table)
}

fn set_region_all(objects: &[Arc<dyn region::RegionObject>], target: Option<RegionId>) {
    for object in objects {
        object.set_region(target);
    }
}

fn unlock_all(locked: &[(Arc<Region>, LockMode)], thread: ThreadId) {
    for (region, mode) in locked.iter().rev() {
        let _: Result<()> = region.unlock(thread, *mode);
    }
}

/// Write-locks the current region of every object in `objects` (deduplicated, sorted by region
/// identity), rejecting moves out of the read-only/protected/limbo sentinels. Returns the locks
/// held, for the caller to release via [`unlock_all`] once the move is committed.
fn lock_sources(
    objects: &[Arc<dyn region::RegionObject>],
    thread: ThreadId,
    table: &RegionTable,
    allow_protected: bool,
) -> Result<Vec<(Arc<Region>, LockMode)>> {
    let mut locked: Vec<(Arc<Region>, LockMode)> = Vec::new();
    for object in objects {
        let Some(region_id) = object.region() else {
            continue; // public: nothing to lock
        };
        if RegionTable::is_limbo(region_id) {
            unlock_all(&locked, thread);
            return Err(Error::AccessDenied(
                "objects in transit through a channel cannot be migrated".to_string(),
            ));
        }
        if RegionTable::is_read_only(region_id) {
            unlock_all(&locked, thread);
            return Err(Error::AccessDenied("read-only objects cannot be migrated".to_string()));
        }
        if RegionTable::is_protected(region_id) && !allow_protected {
            unlock_all(&locked, thread);
            return Err(Error::AccessDenied(
                "protected objects cannot be migrated directly; use force_make_public".to_string(),
            ));
        }
        if RegionTable::is_protected(region_id) {
            continue; // force path: nothing to lock, there's no per-object lock on the sentinel
        }
        if locked.iter().any(|(region, _)| region.id() == region_id) {
            continue;
        }
        let Some(region) = table.get(region_id) else {
            unlock_all(&locked, thread);
            return Err(Error::ArgumentError(format!("region {region_id} does not exist")));
        };
        if let Err(error) = region.lock(thread, LockMode::Write) {
            unlock_all(&locked, thread);
            return Err(error);
        }
        locked.push((region, LockMode::Write));
    }
    Ok(locked)
}

/// Moves `objects` to `target`, after validating that `thread` can write-lock every source region
/// and that none is the protected or read-only sentinel.
///
/// # Errors
/// if any source region cannot be write-locked, or is read-only/protected/limbo.
fn migrate_set(objects: &[Arc<dyn region::RegionObject>], target: Option<RegionId>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    let locked = lock_sources(objects, thread, table, false)?;
    set_region_all(objects, target);
    unlock_all(&locked, thread);
    Ok(())
}

/// Moves `object` alone to `target`. Caller is expected to already hold `target` itself if it
/// requires exclusive access; this only validates and locks the *source* region.
///
/// # Errors
/// see [`migrate_set`].
pub fn migrate_norecurse(object: &Arc<dyn region::RegionObject>, target: Option<RegionId>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate_set(std::slice::from_ref(object), target, thread, table)
}

/// Moves the reachable set rooted at `object` to `target`.
///
/// # Errors
/// see [`migrate_set`].
pub fn migrate(object: &Arc<dyn region::RegionObject>, target: Option<RegionId>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate_set(&reachable(object), target, thread, table)
}

/// Assigns `object` alone to a newly created shared (non-fixed-owner) region.
///
/// # Errors
/// see [`migrate_set`].
pub fn share_norecurse(object: &Arc<dyn region::RegionObject>, name: Option<String>, thread: ThreadId, table: &RegionTable) -> Result<RegionId> {
    let region = table.new_region(name, false, None);
    migrate_norecurse(object, Some(region.id()), thread, table)?;
    Ok(region.id())
}

/// Computes the reachable set rooted at `object` and migrates the whole set to a newly created
/// shared region.
///
/// # Errors
/// see [`migrate_set`].
pub fn share(object: &Arc<dyn region::RegionObject>, name: Option<String>, thread: ThreadId, table: &RegionTable) -> Result<RegionId> {
    let region = table.new_region(name, false, None);
    migrate(object, Some(region.id()), thread, table)?;
    Ok(region.id())
}

/// Moves `object` alone into `thread`'s current region.
///
/// # Errors
/// see [`migrate_set`].
pub fn adopt_norecurse(object: &Arc<dyn region::RegionObject>, thread: ThreadId, current_region: Option<RegionId>, table: &RegionTable) -> Result<()> {
    migrate_norecurse(object, current_region, thread, table)
}

/// Moves the reachable set rooted at `object` into `thread`'s current region.
///
/// # Errors
/// see [`migrate_set`].
pub fn adopt(object: &Arc<dyn region::RegionObject>, thread: ThreadId, current_region: Option<RegionId>, table: &RegionTable) -> Result<()> {
    migrate(object, current_region, thread, table)
}

/// Moves `object` alone to the public region.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_public_norecurse(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate_norecurse(object, None, thread, table)
}

/// Moves the reachable set rooted at `object` to the public region.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_public(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate(object, None, thread, table)
}

/// Forces the reachable set rooted at `object` public even if part of it sits in the protected
/// region -- the one operation allowed to pull objects out of [`region::PROTECTED_REGION`].
///
/// # Errors
/// if a non-protected source region cannot be write-locked by `thread`.
pub fn force_make_public(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    let set = reachable(object);
    let locked = lock_sources(&set, thread, table, true)?;
    set_region_all(&set, None);
    unlock_all(&locked, thread);
    Ok(())
}

/// Moves `object` alone into the singleton read-only region. Irreversible: no operation may move
/// an object back out of it.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_read_only_obj(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate_norecurse(object, Some(region::READ_ONLY_REGION), thread, table)
}

/// Moves the reachable set rooted at `object` into the singleton read-only region.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_read_only(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate(object, Some(region::READ_ONLY_REGION), thread, table)
}

/// Moves `object` alone into the singleton protected region: readable by any thread, writable by
/// none until [`force_make_public`] pulls it back out.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_protected_obj(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate_norecurse(object, Some(region::PROTECTED_REGION), thread, table)
}

/// Moves the reachable set rooted at `object` into the singleton protected region.
///
/// # Errors
/// see [`migrate_set`].
pub fn make_protected(object: &Arc<dyn region::RegionObject>, thread: ThreadId, table: &RegionTable) -> Result<()> {
    migrate(object, Some(region::PROTECTED_REGION), thread, table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Node {
        region: Mutex<Option<RegionId>>,
        children: Mutex<Vec<Arc<dyn region::RegionObject>>>,
    }

    impl Node {
        fn leaf(region: Option<RegionId>) -> Arc<Self> {
            Arc::new(Self {
                region: Mutex::new(region),
                children: Mutex::new(Vec::new()),
            })
        }
    }

    impl region::RegionObject for Node {
        fn region(&self) -> Option<RegionId> {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
        fn set_region(&self, region: Option<RegionId>) {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = region;
        }
        fn children(&self) -> Vec<Arc<dyn region::RegionObject>> {
            self.children.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }

        fn clone_shallow(&self, children: Vec<Arc<dyn region::RegionObject>>) -> Arc<dyn region::RegionObject> {
            Arc::new(Self {
                region: Mutex::new(None),
                children: Mutex::new(children),
            })
        }
    }

    #[test]
    fn reachable_visits_each_object_once_even_with_a_cycle() {
        let a = Node::leaf(None);
        let b = Node::leaf(None);
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        b.children.lock().expect("mutex not poisoned").push(Arc::clone(&a) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;
        let set = reachable(&root);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn reachable_stops_at_a_region_boundary() {
        let table = RegionTable::new();
        let other = table.new_region(None, false, None);
        let a = Node::leaf(None);
        let b = Node::leaf(Some(other.id()));
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;
        let set = reachable(&root);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn share_moves_whole_graph_to_a_new_region() {
        let table = RegionTable::new();
        let region = table.new_region(None, false, None);
        let a = Node::leaf(Some(region.id()));
        let b = Node::leaf(Some(region.id()));
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;
        let new_region = share(&root, None, 1, &table).expect("share succeeds");
        assert_ne!(new_region, region.id());
        assert_eq!(root.region(), Some(new_region));
        assert_eq!(b.region(), Some(new_region));
    }

    #[test]
    fn make_public_moves_to_the_nil_region() {
        let table = RegionTable::new();
        let region = table.new_region(None, false, None);
        let object: Arc<dyn region::RegionObject> = Node::leaf(Some(region.id()));
        make_public(&object, 1, &table).expect("make_public succeeds");
        assert!(object.region().is_none());
    }

    #[test]
    fn make_read_only_is_irreversible_via_migrate() {
        let table = RegionTable::new();
        let object: Arc<dyn region::RegionObject> = Node::leaf(None);
        make_read_only(&object, 1, &table).expect("first move succeeds");
        assert_eq!(object.region(), Some(region::READ_ONLY_REGION));
        let err = migrate(&object, None, 1, &table).unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
    }

    #[test]
    fn clone_delimited_produces_an_independent_graph() {
        let table = RegionTable::new();
        let region = table.new_region(None, false, None);
        let a = Node::leaf(Some(region.id()));
        let b = Node::leaf(Some(region.id()));
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;

        let clone = clone_delimited(&root, 1, &table).expect("clone succeeds");
        assert_ne!(clone.region(), root.region());
        assert_eq!(clone.children().len(), 1);
        assert_ne!(Arc::as_ptr(&clone.children()[0]), Arc::as_ptr(&root.children()[0]));
        // originals are untouched
        assert_eq!(root.region(), Some(region.id()));
    }

    #[test]
    fn clone_reachable_crosses_region_boundaries() {
        let table = RegionTable::new();
        let other = table.new_region(None, false, None);
        let a = Node::leaf(None);
        let b = Node::leaf(Some(other.id()));
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;

        let clone = clone_reachable(&root, 1, &table).expect("clone succeeds");
        assert_eq!(clone.children().len(), 1);
        assert_ne!(Arc::as_ptr(&clone.children()[0]), Arc::as_ptr(&b));
    }

    #[test]
    fn clone_reachable_rejects_a_cycle() {
        let a = Node::leaf(None);
        let b = Node::leaf(None);
        a.children.lock().expect("mutex not poisoned").push(Arc::clone(&b) as Arc<dyn region::RegionObject>);
        b.children.lock().expect("mutex not poisoned").push(Arc::clone(&a) as Arc<dyn region::RegionObject>);
        let root: Arc<dyn region::RegionObject> = a;
        let table = RegionTable::new();
        assert!(matches!(clone_reachable(&root, 1, &table), Err(Error::ArgumentError(_))));
    }

    #[test]
    fn force_make_public_pulls_objects_out_of_protected() {
        let table = RegionTable::new();
        let object: Arc<dyn region::RegionObject> = Node::leaf(None);
        make_protected(&object, 1, &table).expect("move to protected succeeds");
        assert_eq!(object.region(), Some(region::PROTECTED_REGION));
        force_make_public(&object, 1, &table).expect("force succeeds");
        assert!(object.region().is_none());
    }
}
