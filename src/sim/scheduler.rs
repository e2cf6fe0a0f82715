//! Discrete-event scheduler.
//!
//! Events are ordered by fire time; events scheduled for the same instant
//! fire in the order they were scheduled. Cancelled events stay in the heap
//! and are skipped when they reach the front.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;
use tracing::trace;

/// Handle for a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

struct Scheduled<E> {
    at: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Single-threaded event queue driving the logical clock.
pub struct Scheduler<E> {
    queue: BinaryHeap<Reverse<Scheduled<E>>>,
    /// Sequence numbers of events that are scheduled and not yet fired or cancelled.
    pending: HashSet<u64>,
    next_seq: u64,
    now: Duration,
    stop_at: Option<Duration>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            pending: HashSet::new(),
            next_seq: 0,
            now: Duration::ZERO,
            stop_at: None,
        }
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `event` to fire `delay` after the current time.
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        self.schedule_at(self.now.saturating_add(delay), event)
    }

    /// Schedule `event` at absolute time `at`. Times in the past fire now.
    pub fn schedule_at(&mut self, at: Duration, event: E) -> EventId {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq);
        self.queue.push(Reverse(Scheduled { at, seq, event }));
        trace!(seq, at = ?at, "Event scheduled");
        EventId(seq)
    }

    /// Cancel a pending event. No-op if it already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) {
        if self.pending.remove(&id.0) {
            trace!(seq = id.0, "Event cancelled");
        }
    }

    /// Whether `id` is still waiting to fire.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id.0)
    }

    /// Events from `stop` onwards are never delivered.
    pub fn stop_at(&mut self, stop: Duration) {
        self.stop_at = Some(stop);
    }

    /// Number of live (not cancelled) events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Advance the clock to the next live event and return it.
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        while let Some(Reverse(next)) = self.queue.peek() {
            if !self.pending.contains(&next.seq) {
                self.queue.pop();
                continue;
            }
            if self.stop_at.is_some_and(|stop| next.at >= stop) {
                return None;
            }

            let Reverse(Scheduled { at, seq, event }) = self.queue.pop()?;
            self.pending.remove(&seq);
            self.now = at;
            return Some((at, event));
        }
        None
    }
}
