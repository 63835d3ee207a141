//! Write-once synchronization variable built on [`crate::monitor::Monitor`].

use crate::error::{Error, Result};
use crate::ids::ThreadId;
use crate::monitor::{Monitor, WaitSlot};
use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cell that may be written exactly once; every `read` blocks until it is.
#[derive(Debug)]
pub struct SyncVar<T> {
    monitor: Monitor,
    written: AtomicBool,
    value: PlMutex<Option<T>>,
}

impl<T: Clone> SyncVar<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            monitor: Monitor::new(),
            written: AtomicBool::new(false),
            value: PlMutex::new(None),
        }
    }

    #[must_use]
    pub fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Writes `value` if this is the first write; chain-releases every blocked reader.
    ///
    /// # Errors
    /// [`Error::AlreadyUsed`] if a value was already written.
    pub fn write(&self, thread: ThreadId, value: T) -> Result<()> {
        self.monitor.lock(thread);
        if self.written.load(Ordering::Acquire) {
            self.monitor.unlock(thread)?;
            return Err(Error::AlreadyUsed("sync variable already written".to_string()));
        }
        *self.value.lock() = Some(value);
        self.written.store(true, Ordering::Release);
        self.monitor.signal(thread)?; // starts the chain release for any blocked readers
        self.monitor.unlock(thread)?;
        Ok(())
    }

    /// Blocks until a value has been written, then returns a clone of it.
    ///
    /// # Errors
    /// if the underlying monitor reports an ownership inconsistency.
    pub fn read(&self, thread: ThreadId) -> Result<T> {
        self.monitor.lock(thread);
        while !self.written.load(Ordering::Acquire) {
            let slot = Arc::new(WaitSlot::new());
            self.monitor.wait(thread, &slot)?;
        }
        let value = self
            .value
            .lock()
            .clone()
            .expect("written flag is only set after the value is stored");
        self.monitor.signal(thread)?; // chain release: wake the next blocked reader, if any
        self.monitor.unlock(thread)?;
        Ok(value)
    }
}

impl<T: Clone> Default for SyncVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread as os_thread;

    #[test]
    fn second_write_fails() {
        let var = SyncVar::new();
        var.write(1, 10).expect("first write succeeds");
        assert!(matches!(var.write(1, 20), Err(Error::AlreadyUsed(_))));
    }

    #[test]
    fn ten_concurrent_writers_exactly_one_wins_and_all_readers_see_it() {
        let var = Arc::new(SyncVar::new());
        let mut writers = Vec::new();
        for id in 1..=10u32 {
            let var = Arc::clone(&var);
            writers.push(os_thread::spawn(move || var.write(u64::from(id), id)));
        }
        let results: Vec<_> = writers.into_iter().map(|handle| handle.join().expect("no panic")).collect();
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);

        let winner = var.read(100).expect("read succeeds");
        let mut readers = Vec::new();
        for id in 200..210u64 {
            let var = Arc::clone(&var);
            readers.push(os_thread::spawn(move || var.read(id)));
        }
        for handle in readers {
            assert_eq!(handle.join().expect("no panic").expect("read succeeds"), winner);
        }
    }
}
