//! Bounded or elastic FIFO channels with deep-copy-free object-graph handoff.
//!
//! `send` migrates the reachable set rooted at its argument into the limbo region at enqueue time
//! and reassigns it to the receiver's current region at dequeue; `transmit` does neither, for
//! values that are already public or otherwise safe to leave where they are.

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::ids::{RegionId, ThreadId};
use crate::migration;
use crate::monitor::{self, Monitor, WaitSlot};
use crate::region::RegionObject;
use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// One enqueued value plus the reachable-set snapshot taken at send time, used to reassign every
/// object's region on dequeue (a no-op snapshot for `transmit`, which never reassigns).
struct Entry {
    value: Arc<dyn RegionObject>,
    children: Vec<Arc<dyn RegionObject>>,
    reassign_on_receive: bool,
}

struct ChannelState {
    queue: VecDeque<Entry>,
    capacity: usize,
}

/// A blocking, optionally growable, FIFO queue of region-tracked values.
pub struct Channel {
    monitor: Monitor,
    state: PlMutex<ChannelState>,
    dynamic: bool,
    waiting: AtomicUsize,
    config: Configuration,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("monitor", &self.monitor)
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("dynamic", &self.dynamic)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

const DEFAULT_DYNAMIC_CAPACITY: usize = 8;

impl Channel {
    /// Creates a channel. `capacity` omitted or negative makes it dynamic (it grows instead of
    /// blocking senders when full); a non-negative value makes it bounded at that capacity.
    #[must_use]
    pub fn new(capacity: Option<i64>, config: Configuration) -> Self {
        let (dynamic, capacity) = match capacity {
            None => (true, DEFAULT_DYNAMIC_CAPACITY),
            Some(value) if value < 0 => (true, DEFAULT_DYNAMIC_CAPACITY),
            Some(value) => (false, usize::try_from(value).unwrap_or(DEFAULT_DYNAMIC_CAPACITY)),
        };
        Self {
            monitor: Monitor::new(),
            state: PlMutex::new(ChannelState {
                queue: VecDeque::new(),
                capacity,
            }),
            dynamic,
            waiting: AtomicUsize::new(0),
            config,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.monitor.id()
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn snapshot_for_send(value: &Arc<dyn RegionObject>) -> Vec<Arc<dyn RegionObject>> {
        let set = migration::reachable(value);
        for object in &set {
            object.set_region(Some(crate::region::LIMBO_REGION));
        }
        set
    }

    fn snapshot_for_transmit(value: &Arc<dyn RegionObject>) -> Vec<Arc<dyn RegionObject>> {
        migration::reachable(value)
    }

    /// Pushes `entry`, blocking for capacity as needed. The caller must hold `self.monitor` locked
    /// and is responsible for signaling and unlocking once it is done with the whole batch.
    fn push_locked(&self, thread: ThreadId, entry: Entry, block_if_full: bool) -> Result<bool> {
        loop {
            let full = {
                let state = self.state.lock();
                !self.dynamic && state.queue.len() >= state.capacity
            };
            if !full {
                break;
            }
            if self.dynamic {
                break;
            }
            if !block_if_full {
                return Ok(false);
            }
            let slot = Arc::new(WaitSlot::new());
            self.monitor.wait(thread, &slot)?;
        }
        {
            let mut state = self.state.lock();
            if self.dynamic && state.queue.len() >= state.capacity {
                state.capacity = self.config.next_channel_capacity(state.capacity);
            }
            state.queue.push_back(entry);
        }
        Ok(true)
    }

    fn push(&self, thread: ThreadId, entry: Entry, block_if_full: bool) -> Result<bool> {
        self.monitor.lock(thread);
        let pushed = self.push_locked(thread, entry, block_if_full)?;
        if pushed {
            self.monitor.signal(thread)?;
        }
        self.monitor.unlock(thread)?;
        Ok(pushed)
    }

    /// Pushes every entry in `entries` under a single critical section, signaling exactly once
    /// after the whole batch (or the prefix of it that fit, for the non-blocking variants) is
    /// enqueued, rather than once per element.
    fn push_many(&self, thread: ThreadId, entries: Vec<Entry>, block_if_full: bool) -> Result<usize> {
        self.monitor.lock(thread);
        let mut pushed = 0;
        for entry in entries {
            match self.push_locked(thread, entry, block_if_full) {
                Ok(true) => pushed += 1,
                Ok(false) => break,
                Err(error) => {
                    if pushed > 0 {
                        self.monitor.signal(thread)?;
                    }
                    self.monitor.unlock(thread)?;
                    return Err(error);
                }
            }
        }
        if pushed > 0 {
            self.monitor.signal(thread)?;
        }
        self.monitor.unlock(thread)?;
        Ok(pushed)
    }

    /// Migrates the reachable set rooted at `value` to the limbo region and enqueues it, blocking
    /// while the channel is full and bounded.
    ///
    /// # Errors
    /// if the monitor reports the calling thread does not own it (should not happen through this
    /// API).
    pub fn send(&self, thread: ThreadId, value: Arc<dyn RegionObject>) -> Result<()> {
        let children = Self::snapshot_for_send(&value);
        self.push(
            thread,
            Entry {
                value,
                children,
                reassign_on_receive: true,
            },
            true,
        )
        .map(|_| ())
    }

    /// As [`Channel::send`], but leaves every object's region untouched.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn transmit(&self, thread: ThreadId, value: Arc<dyn RegionObject>) -> Result<()> {
        let children = Self::snapshot_for_transmit(&value);
        self.push(
            thread,
            Entry {
                value,
                children,
                reassign_on_receive: false,
            },
            true,
        )
        .map(|_| ())
    }

    /// Non-blocking [`Channel::send`]. Returns `false` if the channel is full and bounded.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn try_send(&self, thread: ThreadId, value: Arc<dyn RegionObject>) -> Result<bool> {
        let children = Self::snapshot_for_send(&value);
        self.push(
            thread,
            Entry {
                value,
                children,
                reassign_on_receive: true,
            },
            false,
        )
    }

    /// Non-blocking [`Channel::transmit`].
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn try_transmit(&self, thread: ThreadId, value: Arc<dyn RegionObject>) -> Result<bool> {
        let children = Self::snapshot_for_transmit(&value);
        self.push(
            thread,
            Entry {
                value,
                children,
                reassign_on_receive: false,
            },
            false,
        )
    }

    fn entries_for_send(values: Vec<Arc<dyn RegionObject>>) -> Vec<Entry> {
        values
            .into_iter()
            .map(|value| {
                let children = Self::snapshot_for_send(&value);
                Entry {
                    value,
                    children,
                    reassign_on_receive: true,
                }
            })
            .collect()
    }

    fn entries_for_transmit(values: Vec<Arc<dyn RegionObject>>) -> Vec<Entry> {
        values
            .into_iter()
            .map(|value| {
                let children = Self::snapshot_for_transmit(&value);
                Entry {
                    value,
                    children,
                    reassign_on_receive: false,
                }
            })
            .collect()
    }

    /// Enqueues every element of `values` in order under a single critical section, signaling
    /// once the whole batch is in. Blocks as capacity requires between elements; atomicity across
    /// elements is not guaranteed -- a concurrent receiver may interleave.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn multi_send(&self, thread: ThreadId, values: Vec<Arc<dyn RegionObject>>) -> Result<()> {
        self.push_many(thread, Self::entries_for_send(values), true).map(|_| ())
    }

    /// As [`Channel::multi_send`], without region reassignment.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn multi_transmit(&self, thread: ThreadId, values: Vec<Arc<dyn RegionObject>>) -> Result<()> {
        self.push_many(thread, Self::entries_for_transmit(values), true).map(|_| ())
    }

    /// Non-blocking [`Channel::multi_send`]. Returns the count actually enqueued, `0..=values.len()`.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn try_multi_send(&self, thread: ThreadId, values: Vec<Arc<dyn RegionObject>>) -> Result<usize> {
        self.push_many(thread, Self::entries_for_send(values), false)
    }

    /// Non-blocking [`Channel::multi_transmit`].
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn try_multi_transmit(&self, thread: ThreadId, values: Vec<Arc<dyn RegionObject>>) -> Result<usize> {
        self.push_many(thread, Self::entries_for_transmit(values), false)
    }

    fn pop(&self, thread: ThreadId, current_region: Option<RegionId>, block_if_empty: bool) -> Result<Option<Arc<dyn RegionObject>>> {
        self.monitor.lock(thread);
        loop {
            if !self.state.lock().queue.is_empty() {
                break;
            }
            if !block_if_empty {
                self.monitor.unlock(thread)?;
                return Ok(None);
            }
            let slot = Arc::new(WaitSlot::new());
            self.monitor.wait(thread, &slot)?;
        }
        let entry = self.state.lock().queue.pop_front();
        self.monitor.signal(thread)?;
        self.monitor.unlock(thread)?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.reassign_on_receive {
            for object in &entry.children {
                object.set_region(current_region);
            }
        }
        Ok(Some(entry.value))
    }

    /// Blocks while the channel is empty, then returns the head value.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn receive(&self, thread: ThreadId, current_region: Option<RegionId>) -> Result<Arc<dyn RegionObject>> {
        self.pop(thread, current_region, true)?.ok_or_else(|| {
            Error::LockError("receive woke with an empty queue".to_string())
        })
    }

    /// Non-blocking [`Channel::receive`]; returns `default` if the channel is empty.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn try_receive(
        &self,
        thread: ThreadId,
        current_region: Option<RegionId>,
        default: Arc<dyn RegionObject>,
    ) -> Result<Arc<dyn RegionObject>> {
        Ok(self.pop(thread, current_region, false)?.unwrap_or(default))
    }

    /// Returns up to `n` elements without blocking for more than are already present; atomic
    /// within this call relative to other receivers.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn multi_receive(&self, thread: ThreadId, current_region: Option<RegionId>, n: usize) -> Result<Vec<Arc<dyn RegionObject>>> {
        self.monitor.lock(thread);
        let mut entries = Vec::new();
        {
            let mut state = self.state.lock();
            let take = n.min(state.queue.len());
            for _ in 0..take {
                if let Some(entry) = state.queue.pop_front() {
                    entries.push(entry);
                }
            }
        }
        if !entries.is_empty() {
            self.monitor.signal(thread)?;
        }
        self.monitor.unlock(thread)?;
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.reassign_on_receive {
                for object in &entry.children {
                    object.set_region(current_region);
                }
            }
            values.push(entry.value);
        }
        Ok(values)
    }

    /// Returns a snapshot of currently enqueued values without removing them.
    ///
    /// # Errors
    /// see [`Channel::send`].
    pub fn inspect(&self, thread: ThreadId) -> Result<Vec<Arc<dyn RegionObject>>> {
        self.monitor.lock(thread);
        let values = self.state.lock().queue.iter().map(|entry| Arc::clone(&entry.value)).collect();
        self.monitor.unlock(thread)?;
        Ok(values)
    }

    fn bump_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::AcqRel);
    }

    fn drop_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Waits on several channels at once, returning the received value and the 1-based index of the
/// channel it came from. Distributes wakeups across equally-ready channels by starting the probe
/// at a per-caller pseudo-random index (`seed = seed * 5 + 1`), then falls back to a sorted
/// monitor wait-any when every channel is empty.
///
/// # Errors
/// if the underlying wait-any reports an inconsistency (see [`monitor::wait_any`]).
pub fn receive_any_with_index(
    channels: &[&Channel],
    thread: ThreadId,
    current_region: Option<RegionId>,
    seed: &AtomicU64,
) -> Result<(Arc<dyn RegionObject>, usize)> {
    assert!(!channels.is_empty(), "receive_any requires at least one channel");

    let mut order: Vec<usize> = (0..channels.len()).collect();
    order.sort_by_key(|&i| channels[i].monitor.id());

    loop {
        let raw_seed = seed.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.wrapping_mul(5).wrapping_add(1)));
        let start = (raw_seed.unwrap_or(0) as usize) % order.len();

        monitor::lock_sorted(
            &order.iter().map(|&i| &channels[i].monitor).collect::<Vec<_>>(),
            thread,
        );

        let mut found = None;
        for offset in 0..order.len() {
            let sorted_pos = (start + offset) % order.len();
            let original_index = order[sorted_pos];
            if !channels[original_index].state.lock().queue.is_empty() {
                found = Some(original_index);
                break;
            }
        }

        if let Some(original_index) = found {
            let entry = channels[original_index].state.lock().queue.pop_front();
            for &i in &order {
                if i == original_index {
                    channels[i].monitor.signal(thread)?;
                    channels[i].monitor.unlock(thread)?;
                } else {
                    channels[i].monitor.unlock(thread)?;
                }
            }
            let Some(entry) = entry else {
                return Err(Error::LockError("receive_any found an entry that vanished".to_string()));
            };
            if entry.reassign_on_receive {
                for object in &entry.children {
                    object.set_region(current_region);
                }
            }
            return Ok((entry.value, original_index + 1));
        }

        for &i in &order {
            channels[i].bump_waiting();
        }
        let monitors: Vec<&Monitor> = order.iter().map(|&i| &channels[i].monitor).collect();
        let slot = Arc::new(WaitSlot::new());
        let woken_sorted_index = monitor::wait_any(&monitors, thread, &slot)?;
        for &i in &order {
            channels[i].drop_waiting();
        }
        // release the monitor wait_any kept locked (on the winner) so the loop can retry cleanly
        let winner = order[woken_sorted_index];
        channels[winner].monitor.unlock(thread)?;
    }
}

/// As [`receive_any_with_index`], discarding the index.
///
/// # Errors
/// see [`receive_any_with_index`].
pub fn receive_any(
    channels: &[&Channel],
    thread: ThreadId,
    current_region: Option<RegionId>,
    seed: &AtomicU64,
) -> Result<Arc<dyn RegionObject>> {
    receive_any_with_index(channels, thread, current_region, seed).map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Leaf {
        region: StdMutex<Option<RegionId>>,
    }
    impl Leaf {
        fn new() -> Arc<Self> {
            Arc::new(Self { region: StdMutex::new(None) })
        }
    }
    impl RegionObject for Leaf {
        fn region(&self) -> Option<RegionId> {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
        fn set_region(&self, region: Option<RegionId>) {
            *self.region.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = region;
        }
        fn children(&self) -> Vec<Arc<dyn RegionObject>> {
            Vec::new()
        }

        fn clone_shallow(&self, _children: Vec<Arc<dyn RegionObject>>) -> Arc<dyn RegionObject> {
            Leaf::new()
        }
    }

    #[test]
    fn bounded_capacity_one_preserves_fifo_order() {
        let channel = Channel::new(Some(1), Configuration::default());
        for value in 1..=5u8 {
            let leaf = Leaf::new();
            let _ = value;
            channel.send(1, leaf).expect("send succeeds");
            channel.receive(1, None).expect("receive succeeds");
        }
        assert!(channel.is_empty());
    }

    #[test]
    fn dynamic_channel_grows_instead_of_blocking() {
        let channel = Channel::new(None, Configuration::default());
        for _ in 0..20 {
            channel.send(1, Leaf::new()).expect("dynamic channel never blocks senders");
        }
        assert_eq!(channel.len(), 20);
        assert!(channel.capacity() >= 20);
    }

    #[test]
    fn try_receive_returns_default_when_empty() {
        let channel = Channel::new(Some(4), Configuration::default());
        let default = Leaf::new();
        let got = channel
            .try_receive(1, None, Arc::clone(&default) as Arc<dyn RegionObject>)
            .expect("try_receive does not fail on empty");
        assert!(Arc::ptr_eq(&got, &(default as Arc<dyn RegionObject>)));
    }

    #[test]
    fn send_migrates_to_limbo_and_receive_restores_region() {
        let channel = Channel::new(Some(4), Configuration::default());
        let leaf: Arc<dyn RegionObject> = Leaf::new();
        channel.send(1, Arc::clone(&leaf)).expect("send succeeds");
        assert_eq!(leaf.region(), Some(crate::region::LIMBO_REGION));
        let received = channel.receive(2, Some(42)).expect("receive succeeds");
        assert_eq!(received.region(), Some(42));
    }

    #[test]
    fn transmit_leaves_region_untouched() {
        let channel = Channel::new(Some(4), Configuration::default());
        let leaf: Arc<dyn RegionObject> = Leaf::new();
        channel.transmit(1, Arc::clone(&leaf)).expect("transmit succeeds");
        assert_eq!(leaf.region(), None);
        let received = channel.receive(2, Some(42)).expect("receive succeeds");
        assert_eq!(received.region(), None);
    }

    #[test]
    fn receive_any_returns_value_from_whichever_channel_has_one() {
        let a = Channel::new(Some(4), Configuration::default());
        let b = Channel::new(Some(4), Configuration::default());
        b.send(1, Leaf::new()).expect("send succeeds");
        let seed = AtomicU64::new(7);
        let (_value, index) = receive_any_with_index(&[&a, &b], 2, None, &seed).expect("resolves");
        assert_eq!(index, 2);
    }
}
