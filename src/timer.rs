//! Single-threaded timer queue.
//!
//! Engines own one `TimerQueue` each and are driven by whoever polls
//! [`TimerQueue::pop_expired`]. Handles stay valid until the timer fires or is
//! cancelled; after that every operation on them is a no-op, so a callback can
//! never run against state that has already been removed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Milliseconds on the engine's monotonic clock.
pub type Millis = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct TimerEntry<K> {
    deadline: Millis,
    key: K,
}

#[derive(Debug)]
pub struct TimerQueue<K> {
    next_id: u64,
    entries: HashMap<u64, TimerEntry<K>>,
    /// (deadline, id); entries whose deadline no longer matches are stale
    heap: BinaryHeap<Reverse<(Millis, u64)>>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, now: Millis, delay: Millis, key: K) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now.saturating_add(delay);
        self.entries.insert(id, TimerEntry { deadline, key });
        self.heap.push(Reverse((deadline, id)));
        TimerHandle(id)
    }

    /// Moves a pending timer. Returns `false` if it already fired or was cancelled.
    pub fn reschedule(&mut self, handle: TimerHandle, now: Millis, delay: Millis) -> bool {
        let deadline = now.saturating_add(delay);
        match self.entries.get_mut(&handle.0) {
            Some(entry) => {
                entry.deadline = deadline;
                self.heap.push(Reverse((deadline, handle.0)));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> Option<K> {
        self.entries.remove(&handle.0).map(|entry| entry.key)
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<Millis> {
        self.entries.get(&handle.0).map(|entry| entry.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, deadline: Millis, id: u64) -> bool {
        self.entries.get(&id).map(|entry| entry.deadline == deadline).unwrap_or(false)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.is_live(deadline, id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Millis> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns the earliest timer due at `now`.
    ///
    /// Timers with equal deadlines fire in scheduling order.
    pub fn pop_expired(&mut self, now: Millis) -> Option<(TimerHandle, K)> {
        self.discard_stale();
        let Reverse((deadline, id)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        self.entries.remove(&id).map(|entry| (TimerHandle(id), entry.key))
    }
}

/// Monotonic millisecond clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }

    pub fn instant_at(&self, millis: Millis) -> Instant {
        self.start + std::time::Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, 30, "c");
        timers.schedule(0, 10, "a");
        timers.schedule(0, 20, "b");

        assert_eq!(timers.next_deadline(), Some(10));
        assert_eq!(timers.pop_expired(5), None);

        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_expired(100)).map(|(_, key)| key).collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_equal_deadlines_keep_schedule_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, 10, 1);
        timers.schedule(0, 10, 2);
        assert_eq!(timers.pop_expired(10).map(|(_, k)| k), Some(1));
        assert_eq!(timers.pop_expired(10).map(|(_, k)| k), Some(2));
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let mut timers = TimerQueue::new();
        let handle = timers.schedule(0, 10, ());
        assert!(timers.reschedule(handle, 5, 100));
        assert_eq!(timers.deadline(handle), Some(105));
        assert_eq!(timers.next_deadline(), Some(105));
        assert_eq!(timers.pop_expired(50), None);
        assert!(timers.pop_expired(105).is_some());
        // fired exactly once
        assert!(timers.pop_expired(1000).is_none());
    }

    #[test]
    fn test_reschedule_earlier() {
        let mut timers = TimerQueue::new();
        let handle = timers.schedule(0, 100, ());
        timers.reschedule(handle, 0, 10);
        assert_eq!(timers.pop_expired(10).map(|(h, _)| h), Some(handle));
        assert!(timers.pop_expired(100).is_none());
    }

    #[test]
    fn test_cancelled_handle_is_inert() {
        let mut timers = TimerQueue::new();
        let handle = timers.schedule(0, 10, 7);
        assert_eq!(timers.cancel(handle), Some(7));
        assert!(!timers.is_pending(handle));
        assert!(!timers.reschedule(handle, 0, 10));
        assert_eq!(timers.cancel(handle), None);
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.pop_expired(100).is_none());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut timers = TimerQueue::new();
        let first = timers.schedule(0, 10, ());
        timers.cancel(first);
        let second = timers.schedule(0, 10, ());
        assert_ne!(first, second);
        assert!(!timers.is_pending(first));
    }
}
