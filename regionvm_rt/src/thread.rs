//! Per-thread state machine and the registry that spawns and tracks OS threads.

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::ids::{RegionId, ThreadId};
use crate::keepalive::KeepAliveList;
use crate::monitor::{Monitor, WaitSlot};
use crate::region::{LockStack, RegionTable};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{trace, warn};

/// A thread's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Blocked,
    Terminated,
    Joined,
    Killed,
    Interrupted,
    Paused,
}

/// Interrupt codes are integers `1..=max_interrupt_code`. A handler runs synchronously the next
/// time the target thread's state machine observes a mismatched transition (e.g. an attempted
/// `Blocked -> Running` after being woken while an interrupt is pending).
pub type InterruptCode = u32;

/// What happens when an interrupt is delivered and the thread observes it.
pub enum InterruptHandler {
    /// Run this closure synchronously at the next safe point.
    Invoke(Box<dyn Fn(ThreadId, InterruptCode) + Send + Sync>),
    /// No handler installed: the interrupt is recorded but otherwise ignored by the kernel.
    Fail,
}

impl std::fmt::Debug for InterruptHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invoke(_) => f.debug_tuple("Invoke").field(&"<closure>").finish(),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

/// Per-thread record: state, wakeup slot, current region, and lock stack.
///
/// Everything here is private to the owning thread except `state`, `pending_interrupt`, and the
/// fields `ThreadRegistry` needs to deliver asynchronous actions (kill/pause/resume/interrupt)
/// from another thread.
pub struct ThreadRecord {
    id: ThreadId,
    state: Mutex<ThreadState>,
    wait_slot: Arc<WaitSlot>,
    pending_interrupt: AtomicU32,
    current_region: Mutex<Option<RegionId>>,
    lock_stack: Mutex<LockStack>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    handlers: DashMap<InterruptCode, Arc<InterruptHandler>>,
}

impl ThreadRecord {
    fn new(id: ThreadId, current_region: Option<RegionId>) -> Self {
        Self {
            id,
            state: Mutex::new(ThreadState::Running),
            wait_slot: Arc::new(WaitSlot::new()),
            pending_interrupt: AtomicU32::new(0),
            current_region: Mutex::new(current_region),
            lock_stack: Mutex::new(LockStack::new()),
            join_handle: Mutex::new(None),
            handlers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    #[must_use]
    pub fn current_region(&self) -> Option<RegionId> {
        *self.current_region.lock()
    }

    pub fn set_current_region(&self, region: Option<RegionId>) {
        *self.current_region.lock() = region;
    }

    /// Exposes this thread's lock stack for region-lock acquisition and release.
    pub fn lock_stack(&self) -> &Mutex<LockStack> {
        &self.lock_stack
    }

    /// This thread's private wakeup mailbox, used by [`Monitor::wait`] and
    /// [`crate::monitor::wait_any`].
    #[must_use]
    pub fn wait_slot(&self) -> Arc<WaitSlot> {
        Arc::clone(&self.wait_slot)
    }

    /// Transitions `Running -> Blocked` before a suspension point. Dispatches the installed
    /// handler, if any, when an interrupt arrived since the last safe point.
    ///
    /// Called by [`crate::monitor::Monitor::wait`]/[`crate::monitor::wait_any`] via
    /// [`enter_blocked_current`] -- every blocking primitive in this kernel (region locks,
    /// channels, semaphore, barrier, sync var) bottoms out in one of those two suspension points.
    pub(crate) fn enter_blocked(&self) {
        self.check_and_dispatch_interrupt();
        *self.state.lock() = ThreadState::Blocked;
    }

    /// Transitions `Blocked -> Running` after waking. Dispatches the same way `enter_blocked` does
    /// if an interrupt raced the wakeup.
    pub(crate) fn leave_blocked(&self) {
        *self.state.lock() = ThreadState::Running;
        self.check_and_dispatch_interrupt();
    }

    fn check_and_dispatch_interrupt(&self) {
        let code = self.pending_interrupt.swap(0, Ordering::AcqRel);
        if code == 0 {
            return;
        }
        match self.handlers.get(&code).map(|entry| Arc::clone(entry.value())) {
            Some(handler) => match handler.as_ref() {
                InterruptHandler::Invoke(invoke) => invoke(self.id, code),
                InterruptHandler::Fail => {
                    warn!(thread = self.id, code, "interrupt delivered to a fail-only handler");
                }
            },
            None => {
                warn!(thread = self.id, code, "interrupt delivered with no handler installed");
            }
        }
    }

    fn request_interrupt(&self, code: InterruptCode) {
        self.pending_interrupt.store(code, Ordering::Release);
    }

    fn set_handler(&self, code: InterruptCode, handler: InterruptHandler) {
        self.handlers.insert(code, Arc::new(handler));
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Spawns and tracks the process's OS threads, and the asynchronous actions
/// (kill/pause/resume/interrupt) delivered across them.
pub struct ThreadRegistry {
    config: Configuration,
    regions: Arc<RegionTable>,
    keep_alive: Arc<KeepAliveList>,
    records: DashMap<ThreadId, Arc<ThreadRecord>>,
    single_threaded: Monitor,
}

thread_local! {
    static CURRENT_THREAD: std::cell::Cell<ThreadId> = const { std::cell::Cell::new(0) };
    static CURRENT_RECORD: std::cell::RefCell<Option<Arc<ThreadRecord>>> = const { std::cell::RefCell::new(None) };
}

/// Transitions the calling thread's own record `Running -> Blocked`, if it has one.
///
/// A no-op for threads never registered with a [`ThreadRegistry`] (e.g. this crate's own unit
/// tests driving [`Monitor`] directly with bare thread ids), so [`crate::monitor::Monitor::wait`]
/// and [`crate::monitor::wait_any`] can call it unconditionally at every suspension point.
pub(crate) fn enter_blocked_current() {
    CURRENT_RECORD.with(|cell| {
        if let Some(record) = cell.borrow().as_ref() {
            record.enter_blocked();
        }
    });
}

/// As [`enter_blocked_current`], transitioning `Blocked -> Running` on wake.
pub(crate) fn leave_blocked_current() {
    CURRENT_RECORD.with(|cell| {
        if let Some(record) = cell.borrow().as_ref() {
            record.leave_blocked();
        }
    });
}

impl ThreadRegistry {
    /// Creates a registry sharing the given region table and keep-alive list.
    #[must_use]
    pub fn new(config: Configuration, regions: Arc<RegionTable>, keep_alive: Arc<KeepAliveList>) -> Arc<Self> {
        Arc::new(Self {
            config,
            regions,
            keep_alive,
            records: DashMap::new(),
            single_threaded: Monitor::new(),
        })
    }

    /// `BEGIN_SINGLE_THREADED`: blocks until no other thread is inside a single-threaded section,
    /// then enters one. Reentrant for the calling thread, like any other [`Monitor`] acquisition.
    ///
    /// Enforcing that *ordinary* region/channel/sync operations actually pause while a thread is
    /// inside a single-threaded section is left to the caller (an interpreter's safepoint checks);
    /// this only provides the mutual-exclusion primitive itself.
    pub fn begin_single_threaded(&self, thread: ThreadId) {
        self.single_threaded.lock(thread);
    }

    /// `END_SINGLE_THREADED`: leaves the section entered by [`ThreadRegistry::begin_single_threaded`],
    /// waking the next thread blocked on it, if any.
    ///
    /// # Errors
    /// if `thread` did not hold the section.
    pub fn end_single_threaded(&self, thread: ThreadId) -> Result<()> {
        self.single_threaded.unlock(thread)
    }

    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// The id of the thread calling this function, if it was spawned or adopted by this registry.
    #[must_use]
    pub fn current() -> ThreadId {
        CURRENT_THREAD.with(std::cell::Cell::get)
    }

    /// Returns the calling thread's record, if registered.
    #[must_use]
    pub fn current_record(&self) -> Option<Arc<ThreadRecord>> {
        self.record(Self::current())
    }

    #[must_use]
    pub fn record(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.records.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Spawns a new system thread running `body`, pinning `keep_alive_args` against the GC until
    /// the worker has registered itself (the window the design notes describe: argument packs
    /// live transiently outside any region until the worker starts).
    pub fn spawn<F>(self: &Arc<Self>, keep_alive_args: Vec<Arc<dyn crate::region::RegionObject>>, body: F) -> ThreadId
    where
        F: FnOnce(ThreadId) + Send + 'static,
    {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let current_region = self.regions.new_region(None, true, Some(id)).id();
        let record = Arc::new(ThreadRecord::new(id, Some(current_region)));
        self.records.insert(id, Arc::clone(&record));

        let pins: Vec<_> = keep_alive_args
            .iter()
            .map(|object| self.keep_alive.keep_alive(Arc::clone(object)))
            .collect();

        let registry = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("regionvm-{id}"))
            .spawn(move || {
                CURRENT_THREAD.with(|cell| cell.set(id));
                if let Some(record) = registry.record(id) {
                    CURRENT_RECORD.with(|cell| *cell.borrow_mut() = Some(record));
                }
                for pin in pins {
                    registry.keep_alive.stop_keep_alive(pin);
                }
                trace!(thread = id, "worker started");
                body(id);
                if let Some(record) = registry.record(id) {
                    *record.state.lock() = ThreadState::Terminated;
                }
                trace!(thread = id, "worker terminated");
            })
            .expect("spawning an OS thread");

        *record.join_handle.lock() = Some(handle);
        id
    }

    /// Joins thread `id`, marking its record `Joined`.
    ///
    /// # Errors
    /// if `id` is unknown, or has already been joined.
    pub fn join(&self, id: ThreadId) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {id}")))?;
        if *record.state.lock() == ThreadState::Joined {
            return Err(Error::AlreadyUsed(format!("thread {id} already joined")));
        }
        let handle = record.join_handle.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| {
                Error::LockError(format!("thread {id} panicked before it could be joined"))
            })?;
        }
        *record.state.lock() = ThreadState::Joined;
        Ok(())
    }

    /// Registers a handler to run the next time `thread` observes interrupt `code` at a safe
    /// point.
    ///
    /// # Errors
    /// if `code` exceeds [`Configuration::max_interrupt_code`], or `thread` is unknown.
    pub fn set_interrupt_handler(
        &self,
        thread: ThreadId,
        code: InterruptCode,
        handler: InterruptHandler,
    ) -> Result<()> {
        if code == 0 || code > self.config.max_interrupt_code {
            return Err(Error::OutOfRange(format!(
                "interrupt code {code} outside 1..={}",
                self.config.max_interrupt_code
            )));
        }
        let record = self
            .record(thread)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {thread}")))?;
        record.set_handler(code, handler);
        Ok(())
    }

    /// Delivers interrupt `code` to `id`'s pending-interrupt slot. Dispatch happens the next time
    /// that thread's state machine observes a transition.
    ///
    /// # Errors
    /// if `id` is unknown or `code` is out of range.
    pub fn interrupt(&self, id: ThreadId, code: InterruptCode) -> Result<()> {
        if code == 0 || code > self.config.max_interrupt_code {
            return Err(Error::OutOfRange(format!(
                "interrupt code {code} outside 1..={}",
                self.config.max_interrupt_code
            )));
        }
        let record = self
            .record(id)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {id}")))?;
        record.request_interrupt(code);
        Ok(())
    }

    /// Reserved interrupt codes used to implement `kill`/`pause`/`resume` via the same
    /// asynchronous-delivery mechanism as ordinary interrupts.
    const KILL_CODE: InterruptCode = u32::MAX;
    const PAUSE_CODE: InterruptCode = u32::MAX - 1;
    const RESUME_CODE: InterruptCode = u32::MAX - 2;

    pub fn kill(&self, id: ThreadId) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {id}")))?;
        record.request_interrupt(Self::KILL_CODE);
        *record.state.lock() = ThreadState::Killed;
        Ok(())
    }

    pub fn pause(&self, id: ThreadId) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {id}")))?;
        record.request_interrupt(Self::PAUSE_CODE);
        *record.state.lock() = ThreadState::Paused;
        Ok(())
    }

    pub fn resume(&self, id: ThreadId) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::OutOfRange(format!("unknown thread id {id}")))?;
        record.request_interrupt(Self::RESUME_CODE);
        *record.state.lock() = ThreadState::Running;
        Ok(())
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionObject;

    fn registry() -> Arc<ThreadRegistry> {
        ThreadRegistry::new(
            Configuration::default(),
            Arc::new(RegionTable::new()),
            Arc::new(KeepAliveList::new()),
        )
    }

    #[test]
    fn spawn_and_join_round_trip() {
        let registry = registry();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_in_thread = Arc::clone(&ran);
        let args: Vec<Arc<dyn RegionObject>> = Vec::new();
        let id = registry.spawn(args, move |_id| {
            ran_in_thread.store(true, Ordering::SeqCst);
        });
        registry.join(id).expect("spawned thread joins cleanly");
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(registry.record(id).expect("still registered").state(), ThreadState::Joined);
    }

    #[test]
    fn joining_twice_fails() {
        let registry = registry();
        let args: Vec<Arc<dyn RegionObject>> = Vec::new();
        let id = registry.spawn(args, |_id| {});
        registry.join(id).expect("first join succeeds");
        assert!(registry.join(id).is_err());
    }

    #[test]
    fn blocking_on_a_monitor_transitions_state_and_dispatches_on_wake() {
        let registry = registry();
        let monitor = Arc::new(Monitor::new());
        let monitor_for_worker = Arc::clone(&monitor);
        let dispatched = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let dispatched_for_handler = Arc::clone(&dispatched);
        let args: Vec<Arc<dyn RegionObject>> = Vec::new();
        let id = registry.spawn(args, move |worker_id| {
            monitor_for_worker.lock(worker_id);
            let slot = Arc::new(WaitSlot::new());
            monitor_for_worker.wait(worker_id, &slot).expect("wait succeeds");
            monitor_for_worker.unlock(worker_id).expect("owns monitor");
        });

        registry
            .set_interrupt_handler(
                id,
                1,
                InterruptHandler::Invoke(Box::new(move |_id, _code| {
                    dispatched_for_handler.store(true, Ordering::SeqCst);
                })),
            )
            .expect("known thread");

        // give the worker time to register as a waiter on the monitor
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(registry.record(id).expect("registered").state(), ThreadState::Blocked);

        registry.interrupt(id, 1).expect("known thread");
        monitor.lock(0);
        monitor.signal(0).expect("owns monitor");
        monitor.unlock(0).expect("owns monitor");

        registry.join(id).expect("worker joins");
        assert!(dispatched.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupting_unknown_thread_is_out_of_range() {
        let registry = registry();
        assert!(registry.interrupt(999, 1).is_err());
    }

    #[test]
    fn single_threaded_section_excludes_other_threads() {
        let registry = registry();
        registry.begin_single_threaded(1);
        assert!(!registry.single_threaded.try_lock(2));
        registry.end_single_threaded(1).expect("thread 1 held the section");
        assert!(registry.single_threaded.try_lock(2));
    }
}
