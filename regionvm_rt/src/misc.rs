//! The handful of operations that don't belong to any one component: explicit memory-ordering
//! barriers, and object-graph cloning is re-exported here for discoverability alongside them.
//!
//! `REACHABLE`/`CLONE_REACHABLE`/`CLONE_DELIMITED` live in [`crate::migration`]; re-exported below
//! under their external names so callers don't need to know the module split.

use std::sync::atomic::{fence, Ordering};

pub use crate::migration::{clone_delimited, clone_reachable, reachable};

/// `ORDERED_READ(x)`: runs `read`, then emits an acquire fence so nothing after this call can be
/// reordered ahead of it.
///
/// Region/monitor locking already carries full fences (see [`crate::monitor::Monitor`]); this is
/// for code reading a plain shared variable outside any lock and wanting the same one-directional
/// ordering guarantee without paying for a full lock/unlock pair.
pub fn ordered_read<T>(read: impl FnOnce() -> T) -> T {
    let value = read();
    fence(Ordering::Acquire);
    value
}

/// `ORDERED_WRITE(x)`: emits a release fence, then runs `write`, so nothing before this call can
/// be reordered after it.
pub fn ordered_write<T>(write: impl FnOnce() -> T) -> T {
    fence(Ordering::Release);
    write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn ordered_read_and_write_round_trip_a_value() {
        let cell = AtomicU64::new(0);
        ordered_write(|| cell.store(42, Ordering::Relaxed));
        let observed = ordered_read(|| cell.load(Ordering::Relaxed));
        assert_eq!(observed, 42);
    }
}
