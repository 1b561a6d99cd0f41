//! Component A: the monotonic timer wheel / deadline queue.
//!
//! Grounded on the stubbed binary-heap design in this crate's own
//! `plus::timer` module (never finished upstream) and on the timer
//! semantics of a reactor's chronology: `announce(now)` fires every timer
//! whose deadline has elapsed, in non-decreasing deadline order with ties
//! broken by insertion order, and a timer that fires and is cancelled
//! concurrently delivers exactly one of `deadline` or `cancelled`, never
//! both.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use slab::Slab;

/// Events a [`Timer`] may deliver, as a subset selected at creation time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// The deadline elapsed.
    Deadline,
    /// The timer was cancelled before its deadline elapsed.
    Cancelled,
    /// The timer was closed.
    Closed,
}

/// Whether a timer reschedules itself after firing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recurrence {
    OneShot,
    Periodic(std::time::Duration),
}

/// Opaque handle to a timer registered with a [`Chronology`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

struct TimerSlot {
    deadline: Instant,
    recurrence: Recurrence,
    on_expiry: Option<Box<dyn FnMut(TimerEvent) + Send>>,
    /// Set once `cancel`/`close` has been requested so a concurrently
    /// popped heap entry is discarded instead of fired.
    live: bool,
    /// Monotonically increasing per reschedule, to distinguish stale heap
    /// entries (from a prior scheduling of a periodic timer) from the
    /// current one.
    generation: u64,
}

/// A single scheduled firing, ordered by `(deadline, sequence)`.
struct HeapEntry {
    deadline: Instant,
    sequence: u64,
    id: TimerId,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // on ties, the earliest insertion sequence) pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Monotonic timer wheel: a priority queue of deadlines plus a side table
/// (`Slab`) mapping [`TimerId`] to its current live entry, so `cancel`
/// and `close` before expiry are O(log n) instead of a linear scan of the
/// heap.
pub struct Chronology {
    heap: BinaryHeap<HeapEntry>,
    timers: Slab<TimerSlot>,
    next_sequence: u64,
}

impl Chronology {
    pub fn new() -> Chronology {
        Chronology {
            heap: BinaryHeap::new(),
            timers: Slab::new(),
            next_sequence: 0,
        }
    }

    /// Create a new timer, not yet scheduled. Call [`schedule`](Self::schedule)
    /// to arm it.
    pub fn create_timer(
        &mut self,
        on_expiry: Box<dyn FnMut(TimerEvent) + Send>,
    ) -> TimerId {
        let key = self.timers.insert(TimerSlot {
            deadline: Instant::now(),
            recurrence: Recurrence::OneShot,
            on_expiry: Some(on_expiry),
            live: false,
            generation: 0,
        });
        TimerId(key)
    }

    /// Arm (or re-arm) `timer` to fire at `deadline`.
    pub fn schedule(&mut self, timer: TimerId, deadline: Instant) {
        self.schedule_with(timer, deadline, Recurrence::OneShot);
    }

    pub fn schedule_periodic(&mut self, timer: TimerId, deadline: Instant, period: std::time::Duration) {
        self.schedule_with(timer, deadline, Recurrence::Periodic(period));
    }

    fn schedule_with(&mut self, timer: TimerId, deadline: Instant, recurrence: Recurrence) {
        let Some(slot) = self.timers.get_mut(timer.0) else { return };
        slot.deadline = deadline;
        slot.recurrence = recurrence;
        slot.live = true;
        slot.generation += 1;

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.heap.push(HeapEntry {
            deadline,
            sequence,
            id: timer,
            generation: slot.generation,
        });
    }

    /// Cancel `timer` if it is currently scheduled. Delivers
    /// [`TimerEvent::Cancelled`] unless the timer has already fired or was
    /// already closed, per the one-or-the-other race guarantee of §4.A.
    pub fn cancel(&mut self, timer: TimerId) {
        if let Some(slot) = self.timers.get_mut(timer.0) {
            if slot.live {
                slot.live = false;
                if let Some(mut cb) = slot.on_expiry.take() {
                    cb(TimerEvent::Cancelled);
                    slot.on_expiry = Some(cb);
                }
            }
        }
    }

    /// Terminal: release the timer's callback and drop it from the table.
    pub fn close(&mut self, timer: TimerId) {
        if self.timers.contains(timer.0) {
            let mut slot = self.timers.remove(timer.0);
            if slot.live {
                if let Some(mut cb) = slot.on_expiry.take() {
                    cb(TimerEvent::Closed);
                }
            }
        }
    }

    /// The earliest deadline among currently live timers, if any. Callers
    /// drive their poll loop's timeout from this.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|entry| self.is_current(entry))
            .map(|entry| entry.deadline)
            .min()
    }

    fn is_current(&self, entry: &HeapEntry) -> bool {
        self.timers
            .get(entry.id.0)
            .map(|slot| slot.live && slot.generation == entry.generation)
            .unwrap_or(false)
    }

    /// Fire all timers whose deadline has elapsed as of `now`, in
    /// non-decreasing deadline order (ties broken by insertion order).
    /// Periodic timers are rescheduled for their next period before their
    /// callback runs again on a later `announce`.
    pub fn announce(&mut self, now: Instant) {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();

            // Stale heap entry: the timer was rescheduled or cancelled
            // since this entry was pushed. Discard without firing.
            if !self.is_current(&entry) {
                continue;
            }

            let recurrence = self.timers[entry.id.0].recurrence;
            if let Some(slot) = self.timers.get_mut(entry.id.0) {
                slot.live = false;
            }

            if let Some(slot) = self.timers.get_mut(entry.id.0) {
                if let Some(mut cb) = slot.on_expiry.take() {
                    cb(TimerEvent::Deadline);
                    if self.timers.contains(entry.id.0) {
                        self.timers[entry.id.0].on_expiry = Some(cb);
                    }
                }
            }

            if let Recurrence::Periodic(period) = recurrence {
                if self.timers.contains(entry.id.0) {
                    self.schedule_with(entry.id, entry.deadline + period, recurrence);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timers.iter().all(|(_, slot)| !slot.live)
    }
}

impl Default for Chronology {
    fn default() -> Chronology {
        Chronology::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<(&'static str, TimerEvent)>>>, Box<dyn FnMut(TimerEvent) + Send>) {
        let log: Arc<Mutex<Vec<(&'static str, TimerEvent)>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let cb = move |ev: TimerEvent| log2.lock().unwrap().push(("fired", ev));
        (log, Box::new(cb))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut chrono = Chronology::new();
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let base = Instant::now();
        for (i, offset_ms) in [30u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            let id = i as u32;
            let timer = chrono.create_timer(Box::new(move |_| order.lock().unwrap().push(id)));
            chrono.schedule(timer, base + Duration::from_millis(offset_ms));
        }

        chrono.announce(base + Duration::from_millis(100));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn cancel_before_fire_suppresses_deadline() {
        let mut chrono = Chronology::new();
        let (log, cb) = recorder();
        let timer = chrono.create_timer(cb);
        chrono.schedule(timer, Instant::now() + Duration::from_secs(10));

        chrono.cancel(timer);
        chrono.announce(Instant::now() + Duration::from_secs(20));

        let entries = log.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, TimerEvent::Cancelled);
    }

    #[test]
    fn periodic_timer_reschedules() {
        let mut chrono = Chronology::new();
        let count = Arc::new(Mutex::new(0u32));
        let count2 = count.clone();
        let timer = chrono.create_timer(Box::new(move |_| *count2.lock().unwrap() += 1));

        let base = Instant::now();
        chrono.schedule_periodic(timer, base + Duration::from_millis(10), Duration::from_millis(10));

        chrono.announce(base + Duration::from_millis(35));
        // fires at 10, 20, 30
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn earliest_deadline_reflects_live_timers_only() {
        let mut chrono = Chronology::new();
        let (_log, cb) = recorder();
        let timer = chrono.create_timer(cb);
        let deadline = Instant::now() + Duration::from_secs(5);
        chrono.schedule(timer, deadline);

        assert_eq!(chrono.earliest_deadline(), Some(deadline));
        chrono.cancel(timer);
        assert_eq!(chrono.earliest_deadline(), None);
    }
}
