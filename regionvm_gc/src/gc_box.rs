use std::sync::atomic::{AtomicBool, Ordering};

use crate::GarbageCollector;
use crate::collector::Trace;
use crate::pointers::SafePtr;

/// Internal data structure backing a [`Gc<T>`](crate::Gc) allocation.
///
/// The `marked` flag is not a tri-color collector state -- there is no collector here -- it is a
/// cycle guard used while walking an object graph from a root (see
/// [`GarbageCollector::try_mark_object`]), reset by the caller after each walk.
pub(crate) struct GcBox<T> {
    pub(crate) marked: AtomicBool,
    pub(crate) data: T,
}

impl<T> GcBox<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            marked: AtomicBool::new(false),
            data,
        }
    }

    /// Marks this object if not already marked. Returns `true` if this call marked it.
    pub(crate) fn mark(&self) -> bool {
        self.marked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub(crate) fn unmark(&self) {
        self.marked.store(false, Ordering::Release);
    }
}

impl<T: Trace> Trace for GcBox<T> {
    fn trace(&self, collector: &GarbageCollector) {
        let ptr = SafePtr::from_ptr(std::ptr::from_ref::<GcBox<T>>(self).cast::<u8>());
        if collector.try_mark_object(ptr) {
            self.data.trace(collector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marking() {
        let gc_box = GcBox::new(42);

        assert!(!gc_box.is_marked());
        assert!(gc_box.mark());
        assert!(gc_box.is_marked());
        assert!(!gc_box.mark());

        gc_box.unmark();
        assert!(!gc_box.is_marked());
    }
}
