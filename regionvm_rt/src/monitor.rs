//! The monitor: mutex plus FIFO waiter queue, supporting `wait`/`signal`/`wait_any` over true OS
//! threads.
//!
//! A standard condition variable cannot express waiting on several mutexes at once without
//! releasing and reacquiring them one at a time, which is exactly what `wait_any` must avoid
//! doing non-atomically. Instead every thread owns a private [`WaitSlot`]: a one-shot mailbox
//! that a `signal` on any monitor the thread is waiting on may fill exactly once. The thread
//! blocks on its own slot, not on the monitor it is nominally waiting for; which monitor it was
//! woken by is recorded in the slot itself. This is the pattern the design notes call out as
//! load-bearing and worth preserving even though the rest of the synchronization primitives moved
//! from `tokio` to `std::thread`.

use crate::error::{Error, Result};
use crate::ids::{MonitorId, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// A per-thread wakeup mailbox.
///
/// Exactly one `signal`/`wait_any` resolution may fill a given slot; later attempts observe it
/// already occupied and move on to the next waiter, which is how a waiter registered on several
/// monitors at once (`wait_any`) is claimed by only one of them.
#[derive(Debug)]
pub struct WaitSlot {
    state: Mutex<Option<MonitorId>>,
    condvar: Condvar,
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to claim this slot for `monitor`. Returns `true` if the slot was empty and is now
    /// filled; `false` if another monitor already claimed it.
    fn fill(&self, monitor: MonitorId) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(monitor);
        self.condvar.notify_one();
        true
    }

    /// Blocks until some monitor fills this slot, returning its id.
    fn park_until_filled(&self) -> MonitorId {
        let mut state = self.state.lock();
        loop {
            if let Some(monitor) = *state {
                return monitor;
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Resets the slot so it can be reused by a later wait.
    fn clear(&self) {
        *self.state.lock() = None;
    }
}

#[derive(Debug)]
struct MonitorState {
    owner: Option<ThreadId>,
    entry_count: usize,
    waiters: VecDeque<Arc<WaitSlot>>,
}

/// Mutex plus FIFO waiter queue. Reentrant: the owning thread may lock it repeatedly and must
/// unlock it the same number of times.
#[derive(Debug)]
pub struct Monitor {
    id: MonitorId,
    state: Mutex<MonitorState>,
    free: Condvar,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MonitorState {
                owner: None,
                entry_count: 0,
                waiters: VecDeque::new(),
            }),
            free: Condvar::new(),
        }
    }

    /// This monitor's process-unique id, the total order multi-monitor acquisition sorts by.
    #[must_use]
    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// Acquires the monitor, blocking until available. Reentrant for `thread`.
    pub fn lock(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner == thread => {
                    state.entry_count += 1;
                    return;
                }
                None => {
                    state.owner = Some(thread);
                    state.entry_count = 1;
                    return;
                }
                Some(_) => self.free.wait(&mut state),
            }
        }
    }

    /// Attempts to acquire the monitor without blocking.
    pub fn try_lock(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == thread => {
                state.entry_count += 1;
                true
            }
            None => {
                state.owner = Some(thread);
                state.entry_count = 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Releases one level of the reentrant lock.
    ///
    /// # Errors
    /// if `thread` is not the current owner.
    pub fn unlock(&self, thread: ThreadId) -> Result<()> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(Error::AccessDenied(
                "thread does not own the monitor".to_string(),
            ));
        }
        state.entry_count -= 1;
        if state.entry_count == 0 {
            state.owner = None;
            self.free.notify_one();
        }
        Ok(())
    }

    /// Waits for a signal. The caller must hold the monitor locked on entry; it is released for
    /// the duration of the wait and reacquired (with the same reentrancy depth) before returning.
    ///
    /// # Errors
    /// if `thread` is not the current owner.
    pub fn wait(&self, thread: ThreadId, slot: &Arc<WaitSlot>) -> Result<()> {
        let saved_count = self.release_for_wait(thread, slot)?;
        crate::thread::enter_blocked_current();
        slot.park_until_filled();
        crate::thread::leave_blocked_current();
        slot.clear();
        self.reacquire_after_wait(thread, saved_count);
        Ok(())
    }

    fn release_for_wait(&self, thread: ThreadId, slot: &Arc<WaitSlot>) -> Result<usize> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(Error::AccessDenied(
                "thread does not own the monitor".to_string(),
            ));
        }
        let saved_count = state.entry_count;
        state.owner = None;
        state.entry_count = 0;
        state.waiters.push_back(Arc::clone(slot));
        self.free.notify_one();
        Ok(saved_count)
    }

    fn reacquire_after_wait(&self, thread: ThreadId, saved_count: usize) {
        self.lock(thread);
        self.state.lock().entry_count = saved_count;
    }

    /// Wakes the oldest waiter whose slot is still unclaimed. A no-op if the queue is empty or
    /// every remaining waiter has already been claimed (by a racing `wait_any` on another
    /// monitor).
    ///
    /// # Errors
    /// if `thread` is not the current owner.
    pub fn signal(&self, thread: ThreadId) -> Result<()> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(Error::AccessDenied(
                "thread does not own the monitor".to_string(),
            ));
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.fill(self.id) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn remove_waiter(&self, slot: &Arc<WaitSlot>) {
        let mut state = self.state.lock();
        state.waiters.retain(|waiter| !Arc::ptr_eq(waiter, slot));
    }

    fn force_release(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        state.entry_count = 0;
        self.free.notify_one();
    }
}

/// Acquires every monitor in `sorted`, in order. Callers must pass monitors already sorted
/// ascending by [`Monitor::id`]; this is the deadlock-avoidance discipline for multi-monitor
/// acquisition.
pub fn lock_sorted(sorted: &[&Monitor], thread: ThreadId) {
    debug_assert!(
        sorted.windows(2).all(|pair| pair[0].id() < pair[1].id()),
        "monitors passed to lock_sorted must be strictly sorted by id"
    );
    for monitor in sorted {
        monitor.lock(thread);
    }
}

/// Suspends `thread` on every monitor in `sorted` simultaneously, returning the index of the one
/// that was signaled. The caller must hold every monitor in `sorted` locked on entry (e.g. via
/// [`lock_sorted`]); on return, every monitor except the one at the returned index has been fully
/// released, and the returned one is held with the reentrancy depth it had on entry.
///
/// # Errors
/// if `thread` does not own every monitor in `sorted`, or the slot ends up filled by a monitor
/// not present in `sorted` (a caller bug: a slot must only be shared across monitors it was
/// actually registered with).
pub fn wait_any(sorted: &[&Monitor], thread: ThreadId, slot: &Arc<WaitSlot>) -> Result<usize> {
    debug_assert!(
        sorted.windows(2).all(|pair| pair[0].id() < pair[1].id()),
        "monitors passed to wait_any must be strictly sorted by id"
    );

    let mut saved_counts = Vec::with_capacity(sorted.len());
    for monitor in sorted {
        let state = monitor.state.lock();
        if state.owner != Some(thread) {
            return Err(Error::AccessDenied(
                "thread does not own every monitor in the wait_any set".to_string(),
            ));
        }
        saved_counts.push(state.entry_count);
    }

    for monitor in sorted {
        let mut state = monitor.state.lock();
        state.waiters.push_back(Arc::clone(slot));
        state.owner = None;
        state.entry_count = 0;
        monitor.free.notify_one();
    }

    crate::thread::enter_blocked_current();
    let acquired = slot.park_until_filled();
    crate::thread::leave_blocked_current();
    slot.clear();

    let mut acquired_index = None;
    for (index, monitor) in sorted.iter().enumerate() {
        monitor.lock(thread);
        monitor.remove_waiter(slot);
        if monitor.id() == acquired {
            monitor.state.lock().entry_count = saved_counts[index];
            acquired_index = Some(index);
        } else {
            monitor.force_release();
        }
    }

    acquired_index.ok_or_else(|| {
        Error::LockError("wait_any resolved to a monitor outside the requested set".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread as os_thread;
    use std::time::Duration;

    #[test]
    fn lock_is_reentrant_for_the_owner() {
        let monitor = Monitor::new();
        monitor.lock(1);
        monitor.lock(1);
        assert!(monitor.unlock(1).is_ok());
        assert!(monitor.unlock(1).is_ok());
        assert!(monitor.try_lock(2));
    }

    #[test]
    fn unlock_by_non_owner_is_an_error() {
        let monitor = Monitor::new();
        monitor.lock(1);
        assert!(monitor.unlock(2).is_err());
    }

    #[test]
    fn signal_wakes_fifo_waiters_in_order() {
        let monitor = Arc::new(Monitor::new());
        let woken = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..3u64 {
            let monitor = Arc::clone(&monitor);
            let woken = Arc::clone(&woken);
            handles.push(os_thread::spawn(move || {
                monitor.lock(id);
                let slot = Arc::new(WaitSlot::new());
                monitor.wait(id, &slot).expect("owns monitor");
                woken.lock().push(id);
                monitor.unlock(id).expect("owns monitor");
            }));
            // give each thread time to register as a waiter before the next one starts
            os_thread::sleep(Duration::from_millis(20));
        }

        monitor.lock(99);
        monitor.signal(99).expect("owns monitor");
        monitor.signal(99).expect("owns monitor");
        monitor.signal(99).expect("owns monitor");
        monitor.unlock(99).expect("owns monitor");

        for handle in handles {
            handle.join().expect("thread does not panic");
        }
        assert_eq!(*woken.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn signal_with_no_waiters_is_a_no_op() {
        let monitor = Monitor::new();
        monitor.lock(1);
        assert!(monitor.signal(1).is_ok());
        monitor.unlock(1).expect("owns monitor");
    }

    #[test]
    fn wait_any_returns_index_of_signaled_monitor() {
        let a = Arc::new(Monitor::new());
        let b = Arc::new(Monitor::new());
        let (first, second) = if a.id() < b.id() {
            (Arc::clone(&a), Arc::clone(&b))
        } else {
            (Arc::clone(&b), Arc::clone(&a))
        };

        let waiter = {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            os_thread::spawn(move || {
                first.lock(1);
                second.lock(1);
                let slot = Arc::new(WaitSlot::new());
                let index = wait_any(&[&first, &second], 1, &slot).expect("resolves");
                let owns_first = first.try_lock(1);
                let owns_second = second.try_lock(1);
                (index, owns_first, owns_second)
            })
        };

        os_thread::sleep(Duration::from_millis(20));
        second.lock(2);
        second.signal(2).expect("owns monitor");
        second.unlock(2).expect("owns monitor");

        let (index, owns_first, owns_second) = waiter.join().expect("thread does not panic");
        assert_eq!(index, 1);
        // The winning monitor (second) is still held by thread 1, so thread 1's own try_lock
        // from the same thread id succeeds via reentrancy; the losing one was fully released.
        assert!(owns_second);
        assert!(owns_first);
    }
}
