//! Discrete-Event Simulation Core
//!
//! Simulated time, event handles and a cancellable event queue. Events that
//! share a timestamp fire in the order they were scheduled.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};

// ============================================================================
// Simulated time
// ============================================================================

/// Simulated time with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Convert from fractional seconds, truncating below one nanosecond
    pub fn from_secs_f64(secs: f64) -> Self {
        SimTime((secs * 1e9) as u64)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_micros_f64(&self) -> f64 {
        self.0 as f64 / 1e3
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.0 as f64 / 1e6
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0 + rhs.0)
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 += rhs.0;
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        assert!(self.0 >= rhs.0, "negative simulated time: {} - {}", self, rhs);
        SimTime(self.0 - rhs.0)
    }
}

impl Mul<u64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: u64) -> SimTime {
        SimTime(self.0 * rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ============================================================================
// Event queue
// ============================================================================

/// Handle of a scheduled event, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

struct Scheduled<E> {
    time: SimTime,
    id: EventId,
    payload: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
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
        // Reverse ordering so the BinaryHeap pops the earliest event first;
        // ids are monotonic so equal timestamps keep insertion order.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Min-heap of future events keyed by (time, insertion order)
pub struct EventQueue<E> {
    now: SimTime,
    next_id: u64,
    heap: BinaryHeap<Scheduled<E>>,
    pending: HashSet<EventId>,
}

impl<E> fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("now", &self.now)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_id: 0,
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
        }
    }

    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule `payload` to fire `delay` after the current time
    pub fn schedule(&mut self, delay: SimTime, payload: E) -> EventId {
        let time = self.now + delay;
        self.schedule_at(time, payload)
    }

    /// Schedule `payload` at an absolute time, which must not be in the past
    pub fn schedule_at(&mut self, time: SimTime, payload: E) -> EventId {
        assert!(
            time >= self.now,
            "cannot schedule an event in the past ({} < {})",
            time,
            self.now
        );
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id);
        self.heap.push(Scheduled { time, id, payload });
        id
    }

    /// Cancel a scheduled event. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id)
    }

    /// True while the event is scheduled and has not fired
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id)
    }

    /// Time of the next live event, if any
    pub fn peek_time(&mut self) -> Option<SimTime> {
        while let Some(top) = self.heap.peek() {
            if self.pending.contains(&top.id) {
                return Some(top.time);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the next live event and advance the clock to its timestamp
    pub fn pop(&mut self) -> Option<(SimTime, E)> {
        while let Some(entry) = self.heap.pop() {
            if self.pending.remove(&entry.id) {
                self.now = entry.time;
                return Some((entry.time, entry.payload));
            }
        }
        None
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_micros(20), "late");
        queue.schedule(SimTime::from_micros(10), "early");

        assert_eq!(queue.pop(), Some((SimTime::from_micros(10), "early")));
        assert_eq!(queue.now(), SimTime::from_micros(10));
        assert_eq!(queue.pop(), Some((SimTime::from_micros(20), "late")));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_same_timestamp_is_fifo() {
        let mut queue = EventQueue::new();
        for i in 0..5 {
            queue.schedule(SimTime::from_nanos(7), i);
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel() {
        let mut queue = EventQueue::new();
        let a = queue.schedule(SimTime::from_nanos(1), 'a');
        let b = queue.schedule(SimTime::from_nanos(2), 'b');

        assert!(queue.is_pending(a));
        assert!(queue.cancel(a));
        assert!(!queue.is_pending(a));
        assert!(!queue.cancel(a));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some((SimTime::from_nanos(2), 'b')));
        // Cancelling a fired event is a no-op
        assert!(!queue.cancel(b));
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "in the past")]
    fn test_schedule_in_past_panics() {
        let mut queue = EventQueue::new();
        queue.schedule(SimTime::from_micros(5), ());
        queue.pop();
        queue.schedule_at(SimTime::from_micros(1), ());
    }

    #[test]
    fn test_time_arithmetic() {
        let slot = SimTime::from_micros(500);
        assert_eq!(slot * 2, SimTime::from_millis(1));
        assert_eq!(slot - SimTime::from_nanos(1), SimTime::from_nanos(499_999));
        assert_eq!(SimTime::from_nanos(3).saturating_sub(slot), SimTime::ZERO);
        assert_eq!(SimTime::from_secs_f64(1e-6), SimTime::from_micros(1));
    }
}
