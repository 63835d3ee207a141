use crate::Finalize;
use crate::config::{Configuration, Statistics};
use crate::error::{Error, Result};
use crate::finalizer::{FinalizerFn, create_finalizer_for};
use crate::gc::Gc;
use crate::gc_box::GcBox;
use crate::pointers::{SafePtr, TracePtr};
use crate::root_guard::GcRootGuard;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tracing::trace;

/// The global root registry used by [`Gc::new`] and friends when no explicit collector is given.
pub static GC: LazyLock<Arc<GarbageCollector>> = LazyLock::new(GarbageCollector::new);

/// Trait for objects that can be traced by a garbage collector.
///
/// Objects that contain `Gc<T>` pointers implement this so that a collector driver -- which this
/// crate does not provide -- can traverse object references when deciding what is reachable.
pub trait Trace {
    /// Trace all `Gc<T>` references contained within this object.
    fn trace(&self, collector: &GarbageCollector);
}

/// The root registry, allocation counter and finalizer queue for a collector driver to build on.
///
/// `GarbageCollector` never traces, marks, or sweeps anything by itself. It answers three
/// questions a driver needs: what are the roots, how much has been allocated, and which
/// finalizers are waiting to run.
pub struct GarbageCollector {
    this: Weak<Self>,
    config: Configuration,
    roots: DashMap<usize, TracePtr>,
    next_root_id: AtomicUsize,
    marks: DashMap<usize, ()>,
    finalizers: DashMap<usize, FinalizerFn>,
    next_finalizer_id: AtomicUsize,
    bytes_allocated: AtomicUsize,
    objects_registered: AtomicUsize,
}

impl GarbageCollector {
    /// Creates a new registry with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(Configuration::default())
    }

    /// Creates a new registry with a custom configuration.
    #[must_use]
    pub fn with_config(config: Configuration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            roots: DashMap::new(),
            next_root_id: AtomicUsize::new(0),
            marks: DashMap::new(),
            finalizers: DashMap::new(),
            next_finalizer_id: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            objects_registered: AtomicUsize::new(0),
        })
    }

    /// Returns the configuration this registry was created with.
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Records a new allocation. Called by [`Gc::new`] when it boxes fresh data.
    pub(crate) fn record_allocation(&self, size: usize) {
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        self.objects_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a new object. This is pure bookkeeping; the object is not tracked for tracing
    /// beyond what reaching it through a root already provides.
    pub(crate) fn register_object<T: Send + Sync>(&self, ptr: *const GcBox<T>, size: usize) {
        trace!("registering object at {:#x} with size {size}", ptr as usize);
        self.record_allocation(size);
    }

    /// Registers a new object and queues a finalizer for it, keyed by the returned id. Nothing in
    /// this crate ever calls the finalizer; see [`GarbageCollector::take_finalizer`].
    pub(crate) fn register_object_with_finalizer<T>(&self, ptr: *const GcBox<T>, size: usize)
    where
        T: Send + Sync + Finalize,
    {
        trace!(
            "registering object with finalizer at {:#x} with size {size}",
            ptr as usize
        );
        self.record_allocation(size);
        // Safety: `ptr` points at a live `GcBox<T>` just boxed by the caller; `&(*ptr).data` stays
        // valid for as long as the box does, which outlives this registration.
        let data_ptr: *const T = unsafe { std::ptr::addr_of!((*ptr).data) };
        let finalizer = create_finalizer_for(data_ptr);
        let id = self.next_finalizer_id.fetch_add(1, Ordering::Relaxed);
        self.finalizers.insert(id, finalizer);
    }

    /// Removes and returns a pending finalizer by id, if one is still registered. A collector
    /// driver calls this once it has determined the corresponding object is unreachable.
    pub fn take_finalizer(&self, id: usize) -> Option<FinalizerFn> {
        self.finalizers.remove(&id).map(|(_, f)| f)
    }

    /// Number of finalizers still waiting to be taken and run.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    /// Adds a `Gc<T>` root and returns its id.
    pub fn add_root<T: Trace>(&self, root: &Gc<T>) -> usize {
        let root_id = self.next_root_id.fetch_add(1, Ordering::Relaxed);
        let gcbox_ptr = root.ptr.as_ptr();
        let gc_trace_ptr = TracePtr::new_from_ptr(gcbox_ptr);
        self.roots.insert(root_id, gc_trace_ptr);
        trace!("adding root {:#x} with id {root_id}", gcbox_ptr as usize);
        root_id
    }

    /// Creates a [`GcRootGuard`] that removes the root automatically when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if this collector's `Weak` self-reference can no longer be upgraded,
    /// which only happens if the `Arc<GarbageCollector>` that owns it has already been dropped.
    pub fn create_root_guard<T: Trace>(&self, root: Gc<T>) -> Result<GcRootGuard<T>> {
        let Some(collector) = self.this.upgrade() else {
            return Err(Error::RootError(
                "garbage collector has already been dropped".to_string(),
            ));
        };
        Ok(GcRootGuard::new(collector, root))
    }

    /// Removes a root by id. Used by [`GcRootGuard::drop`].
    pub fn remove_root_by_id(&self, root_id: usize) {
        if self.roots.remove(&root_id).is_some() {
            trace!("removed root with id {root_id}");
        }
    }

    /// Number of roots currently registered.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Attempts to mark an object reachable for the current trace pass.
    ///
    /// Returns `true` the first time a given address is marked, `false` on every subsequent call
    /// until [`GarbageCollector::clear_marks`] is called. `Trace` implementations use this to
    /// avoid infinite recursion on cyclic object graphs.
    pub(crate) fn try_mark_object(&self, ptr: SafePtr) -> bool {
        self.marks.insert(ptr.0, ()).is_none()
    }

    /// Clears marks left behind by a trace pass, so the marks table can be reused for the next
    /// one. A collector driver calls this between passes over the same roots.
    pub fn clear_marks(&self) {
        self.marks.clear();
    }

    /// Walks every registered root, collecting the set of object addresses reachable from them.
    ///
    /// This is the `mark_children` entry point a collector driver would call to get its initial
    /// reachable set; this crate does nothing with the result beyond computing it.
    #[must_use]
    pub fn reachable_roots(&self) -> Vec<usize> {
        self.clear_marks();
        let mut reachable = Vec::with_capacity(self.roots.len());
        for entry in &self.roots {
            let trace_ptr = entry.value();
            let addr = trace_ptr.as_raw_ptr() as usize;
            if self.marks.insert(addr, ()).is_none() {
                reachable.push(addr);
                // Safety: every `TracePtr` stored as a root was constructed from a live `GcBox<T>`
                // that is kept alive by the `Gc<T>` the root guard or caller still holds.
                unsafe {
                    trace_ptr.trace(self);
                }
            }
        }
        reachable
    }

    /// A snapshot of current allocation and registry statistics.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        Statistics {
            objects_registered: self.objects_registered.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            roots_active: self.roots.len(),
            finalizers_pending: self.finalizers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(i32);

    impl Trace for Leaf {
        fn trace(&self, _collector: &GarbageCollector) {}
    }

    #[test]
    fn records_allocation_on_new() {
        let gc = GarbageCollector::new();
        let before = gc.statistics().bytes_allocated;
        let _value = Gc::with_collector(&gc, Leaf(1));
        assert!(gc.statistics().bytes_allocated > before);
    }

    #[test]
    fn root_guard_removes_root_on_drop() {
        let gc = GarbageCollector::new();
        let value = Gc::with_collector(&gc, Leaf(1));
        {
            let _guard = gc.create_root_guard(value).expect("collector alive");
            assert_eq!(gc.root_count(), 1);
        }
        assert_eq!(gc.root_count(), 0);
    }

    #[test]
    fn try_mark_object_is_one_shot_until_cleared() {
        let gc = GarbageCollector::new();
        let ptr = SafePtr::from_ptr(std::ptr::from_ref(&42_i32));
        assert!(gc.try_mark_object(ptr));
        assert!(!gc.try_mark_object(ptr));
        gc.clear_marks();
        assert!(gc.try_mark_object(ptr));
    }

    #[test]
    fn reachable_roots_includes_registered_roots() {
        let gc = GarbageCollector::new();
        let value = Gc::with_collector(&gc, Leaf(7));
        let guard = gc.create_root_guard(value).expect("collector alive");
        let reachable = gc.reachable_roots();
        assert_eq!(reachable.len(), 1);
        drop(guard);
    }
}
