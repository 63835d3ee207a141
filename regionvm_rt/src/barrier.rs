//! Reusable barrier with reset detection, built on [`crate::monitor::Monitor`].

use crate::error::{Error, Result};
use crate::ids::ThreadId;
use crate::monitor::{Monitor, WaitSlot};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A barrier that releases all participants once `remaining` reaches zero, and reports a reset
/// error to any waiter still blocked when `start` is called again.
#[derive(Debug)]
pub struct Barrier {
    monitor: Monitor,
    remaining: AtomicUsize,
    phase: AtomicU64,
    waiters: AtomicUsize,
}

impl Barrier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            monitor: Monitor::new(),
            remaining: AtomicUsize::new(0),
            phase: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }

    /// (Re)starts the barrier for `n` participants, bumping the phase. Any thread still blocked in
    /// `wait` from a prior phase will observe the phase change on wake and report
    /// [`Error::BarrierReset`].
    ///
    /// # Errors
    /// if the underlying monitor reports an ownership inconsistency.
    pub fn start(&self, thread: ThreadId, n: usize) -> Result<()> {
        self.monitor.lock(thread);
        self.remaining.store(n, Ordering::Release);
        self.phase.fetch_add(1, Ordering::AcqRel);
        self.monitor.signal(thread)?; // wake any reset-pending waiters so they observe the new phase
        self.monitor.unlock(thread)?;
        Ok(())
    }

    /// Decrements the remaining-arrivals count; blocks until the last participant arrives, then
    /// chain-releases every other waiter.
    ///
    /// # Errors
    /// [`Error::BarrierReset`] if `start` was called again while this call was blocked.
    pub fn wait(&self, thread: ThreadId) -> Result<()> {
        self.monitor.lock(thread);
        let observed_phase = self.phase.load(Ordering::Acquire);
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            loop {
                let slot = Arc::new(WaitSlot::new());
                self.monitor.wait(thread, &slot)?;
                if self.phase.load(Ordering::Acquire) != observed_phase {
                    // chain release: a reset must wake every blocked waiter, not just one
                    self.monitor.signal(thread)?;
                    self.monitor.unlock(thread)?;
                    return Err(Error::BarrierReset);
                }
                if self.remaining.load(Ordering::Acquire) == 0 {
                    break;
                }
            }
        }
        // chain release: wake one more waiter, who will wake the next when it re-observes count == 0
        self.monitor.signal(thread)?;
        self.monitor.unlock(thread)?;
        Ok(())
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread as os_thread;

    #[test]
    fn three_participants_all_return() {
        let barrier = Arc::new(Barrier::new());
        barrier.start(0, 3).expect("start succeeds");

        let mut handles = Vec::new();
        for id in 1..=3u64 {
            let barrier = Arc::clone(&barrier);
            handles.push(os_thread::spawn(move || barrier.wait(id)));
        }
        for handle in handles {
            handle.join().expect("thread does not panic").expect("barrier wait succeeds");
        }
    }

    #[test]
    fn restart_while_waiting_reports_reset() {
        let barrier = Arc::new(Barrier::new());
        barrier.start(0, 2).expect("start succeeds");

        let waiter_results = Arc::new(Mutex::new(None));
        let results = Arc::clone(&waiter_results);
        let barrier_for_waiter = Arc::clone(&barrier);
        let waiter = os_thread::spawn(move || {
            let result = barrier_for_waiter.wait(1);
            *results.lock().expect("mutex not poisoned") = Some(result);
        });

        os_thread::sleep(std::time::Duration::from_millis(20));
        barrier.start(0, 5).expect("restart succeeds");
        waiter.join().expect("thread does not panic");

        let outcome = waiter_results.lock().expect("mutex not poisoned").take().expect("waiter completed");
        assert!(matches!(outcome, Err(Error::BarrierReset)));
    }
}
