//! Process-wide keep-alive registry: pins objects against collection independent of region
//! membership, for values that are reachable only transiently (e.g. a channel payload between
//! send and the receiver's region assignment, or a thread's spawn arguments before the worker
//! registers itself).

use crate::region::RegionObject;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PIN_ID: AtomicU64 = AtomicU64::new(1);

/// A token returned by [`KeepAliveList::keep_alive`]. Dropping it without calling
/// [`KeepAliveList::stop_keep_alive`] leaks the pin for the list's lifetime; there is no implicit
/// `Drop` release because the list does not know which thread is allowed to release a pin it
/// didn't take out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(u64);

/// A flat registry of pinned objects, keyed by [`PinId`]. Functionally a root set parallel to
/// `regionvm_gc`'s own roots: this one exists so the kernel can pin objects for reasons specific
/// to its own lifecycle bookkeeping (in-flight channel payloads, spawn argument packs) without the
/// collector crate needing to know about regions or threads at all.
#[derive(Default)]
pub struct KeepAliveList {
    pins: DashMap<u64, Arc<dyn RegionObject>>,
}

impl std::fmt::Debug for KeepAliveList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveList").field("pinned", &self.pins.len()).finish_non_exhaustive()
    }
}

impl KeepAliveList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `object` until [`KeepAliveList::stop_keep_alive`] is called with the returned id.
    pub fn keep_alive(&self, object: Arc<dyn RegionObject>) -> PinId {
        let id = NEXT_PIN_ID.fetch_add(1, Ordering::Relaxed);
        self.pins.insert(id, object);
        PinId(id)
    }

    /// Releases a pin. A no-op if `id` was already released.
    pub fn stop_keep_alive(&self, id: PinId) {
        self.pins.remove(&id.0);
    }

    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RegionId;

    struct Dummy;
    impl RegionObject for Dummy {
        fn region(&self) -> Option<RegionId> {
            None
        }
        fn set_region(&self, _region: Option<RegionId>) {}
        fn children(&self) -> Vec<Arc<dyn RegionObject>> {
            Vec::new()
        }
        fn clone_shallow(&self, _children: Vec<Arc<dyn RegionObject>>) -> Arc<dyn RegionObject> {
            Arc::new(Dummy)
        }
    }

    #[test]
    fn pin_and_release_round_trip() {
        let list = KeepAliveList::new();
        let object: Arc<dyn RegionObject> = Arc::new(Dummy);
        let pin = list.keep_alive(object);
        assert_eq!(list.pinned_count(), 1);
        list.stop_keep_alive(pin);
        assert_eq!(list.pinned_count(), 0);
    }

    #[test]
    fn releasing_an_already_released_pin_is_a_no_op() {
        let list = KeepAliveList::new();
        let object: Arc<dyn RegionObject> = Arc::new(Dummy);
        let pin = list.keep_alive(object);
        list.stop_keep_alive(pin);
        list.stop_keep_alive(pin);
        assert_eq!(list.pinned_count(), 0);
    }
}
