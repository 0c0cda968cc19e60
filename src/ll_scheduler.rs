use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use hashbrown::HashSet;

use crate::ll_interface::{SimEvent, SimTime};

/// Handle for cancelling a scheduled event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct Entry<E> {
    time: SimTime,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    // reversed: BinaryHeap is a max-heap, we want earliest time, then lowest seq
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue<E> {
    now: SimTime,
    next_seq: u64,
    heap: BinaryHeap<Entry<E>>,
    pending: HashSet<u64>,
}

/// Relative-time event queue shared by every component of one simulation.
///
/// Cloning yields another handle onto the same time line. Only scheduling and
/// cancellation are offered; nothing here ever calls back into a component.
pub struct Scheduler<E = SimEvent> {
    inner: Rc<RefCell<Queue<E>>>,
}

pub type SimScheduler = Scheduler<SimEvent>;

impl<E> Clone for Scheduler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Queue {
                now: 0.0,
                next_seq: 0,
                heap: BinaryHeap::new(),
                pending: HashSet::new(),
            })),
        }
    }

    pub fn now(&self) -> SimTime {
        self.inner.borrow().now
    }

    /// Schedules `event` `delay` seconds from now. Negative or NaN delays
    /// count as zero; events with equal time fire in scheduling order.
    pub fn schedule_in(&self, delay: SimTime, event: E) -> EventHandle {
        let delay = if delay.is_nan() || delay < 0.0 { 0.0 } else { delay };

        let mut queue = self.inner.borrow_mut();
        let seq = queue.next_seq;
        queue.next_seq += 1;

        let time = queue.now + delay;
        queue.heap.push(Entry { time, seq, event });
        queue.pending.insert(seq);

        EventHandle(seq)
    }

    /// Returns true if the event was still pending and is now cancelled.
    /// Cancelling an event that already fired has no effect.
    pub fn cancel(&self, handle: EventHandle) -> bool {
        self.inner.borrow_mut().pending.remove(&handle.0)
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.inner.borrow().pending.contains(&handle.0)
    }

    /// Time of the next pending event, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        let mut queue = self.inner.borrow_mut();
        queue.drop_cancelled();
        queue.heap.peek().map(|entry| entry.time)
    }

    /// Pops the earliest pending event and advances the clock to it.
    pub fn next(&self) -> Option<(SimTime, E)> {
        let mut queue = self.inner.borrow_mut();
        queue.drop_cancelled();

        let entry = queue.heap.pop()?;
        queue.pending.remove(&entry.seq);
        queue.now = entry.time;

        Some((entry.time, entry.event))
    }

    /// Moves the clock forward to `time` without firing anything. Stops at
    /// the next pending event if that comes earlier.
    pub fn advance_to(&self, time: SimTime) {
        let mut queue = self.inner.borrow_mut();
        queue.drop_cancelled();

        let limit = match queue.heap.peek() {
            Some(entry) => time.min(entry.time),
            None => time,
        };
        if limit > queue.now {
            queue.now = limit;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }
}

impl<E> Queue<E> {
    fn drop_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.pending.contains(&top.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
