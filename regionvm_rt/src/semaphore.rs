//! Counting semaphore built on [`crate::monitor::Monitor`].

use crate::error::Result;
use crate::ids::ThreadId;
use crate::monitor::{Monitor, WaitSlot};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A non-negative counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    monitor: Monitor,
    count: AtomicUsize,
    /// Number of threads currently blocked in `wait`. `try_wait` decrements this unconditionally
    /// even though it never increments it -- see `try_wait`'s doc comment.
    waiters: AtomicUsize,
}

impl Semaphore {
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            monitor: Monitor::new(),
            count: AtomicUsize::new(initial),
            waiters: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Blocks while the count is zero, then decrements it.
    ///
    /// # Errors
    /// if the underlying monitor reports an ownership inconsistency.
    pub fn wait(&self, thread: ThreadId) -> Result<()> {
        self.monitor.lock(thread);
        while self.count.load(Ordering::Acquire) == 0 {
            self.waiters.fetch_add(1, Ordering::AcqRel);
            let slot = Arc::new(WaitSlot::new());
            let result = self.monitor.wait(thread, &slot);
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            result?;
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.monitor.unlock(thread)?;
        Ok(())
    }

    /// Non-blocking `wait`. Decrements the waiter counter unconditionally, even though this path
    /// never incremented it -- asymmetric with `wait`, and preserved as such rather than "fixed":
    /// nothing downstream treats `waiters` as more than an advisory count, and a caller relying on
    /// it should not assume it tracks blocked `wait` calls exactly (it is saturating, never
    /// negative, but can read low if `try_wait` races ahead of matching `wait` calls).
    ///
    /// # Errors
    /// if the underlying monitor reports an ownership inconsistency.
    pub fn try_wait(&self, thread: ThreadId) -> Result<bool> {
        self.monitor.lock(thread);
        let available = self.count.load(Ordering::Acquire) > 0;
        if available {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        let _ = self.waiters.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(w.saturating_sub(1)));
        self.monitor.unlock(thread)?;
        Ok(available)
    }

    /// Increments the count and wakes one waiter, if any.
    ///
    /// # Errors
    /// if the underlying monitor reports an ownership inconsistency.
    pub fn signal(&self, thread: ThreadId) -> Result<()> {
        self.monitor.lock(thread);
        self.count.fetch_add(1, Ordering::AcqRel);
        self.monitor.signal(thread)?;
        self.monitor.unlock(thread)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_blocks_until_signaled_then_decrements() {
        let semaphore = Semaphore::new(0);
        semaphore.signal(1).expect("signal succeeds");
        semaphore.wait(2).expect("wait succeeds once signaled");
        assert_eq!(semaphore.count(), 0);
    }

    #[test]
    fn try_wait_fails_without_blocking_when_empty() {
        let semaphore = Semaphore::new(0);
        assert!(!semaphore.try_wait(1).expect("does not error"));
    }

    #[test]
    fn try_wait_succeeds_and_decrements_when_available() {
        let semaphore = Semaphore::new(2);
        assert!(semaphore.try_wait(1).expect("does not error"));
        assert_eq!(semaphore.count(), 1);
    }
}
