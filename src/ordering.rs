//! Per-publisher stamp-ordered queue.
//!
//! A `Feed` holds one [`OrderedQueue`] per publisher it hears from: a min-heap keyed
//! by `stamp` plus a `next` counter, buffering out-of-order arrivals and draining the
//! heap's contiguous prefix inside one held lock per incoming envelope.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::wire::{Stamp, StampedMsg};

struct HeapEntry(Reverse<Stamp>, StampedMsg);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

struct Inner {
    next: Stamp,
    heap: BinaryHeap<HeapEntry>,
}

/// One publisher's ordering queue: buffers out-of-order arrivals and releases the
/// contiguous stamp-ordered prefix as soon as it's available.
pub struct OrderedQueue {
    inner: Mutex<Inner>,
}

impl OrderedQueue {
    pub fn new() -> Self {
        OrderedQueue {
            inner: Mutex::new(Inner {
                next: 0,
                heap: BinaryHeap::new(),
            }),
        }
    }

    /// The next stamp this queue expects to release.
    pub fn next_stamp(&self) -> Stamp {
        self.inner.lock().next
    }

    /// Inserts `msg` and drains every envelope now contiguous with `next`, in stamp
    /// order. The insert and the drain happen under one held, synchronous lock so no
    /// other task can observe a partially-drained queue.
    ///
    /// # Panics
    ///
    /// Panics if `msg.stamp < next`: a conforming publisher never sends a change with
    /// a stamp less than the one returned by a prior start-stamp read.
    pub fn push_and_drain(&self, msg: StampedMsg) -> Vec<StampedMsg> {
        let mut guard = self.inner.lock();
        assert!(
            msg.stamp >= guard.next,
            "publisher sent stamp {} but queue already released up to {}",
            msg.stamp,
            guard.next
        );
        guard.heap.push(HeapEntry(Reverse(msg.stamp), msg));
        let mut ready = Vec::new();
        while let Some(top) = guard.heap.peek() {
            if top.1.stamp == guard.next {
                let entry = guard.heap.pop().expect("peeked");
                ready.push(entry.1);
                guard.next += 1;
            } else {
                break;
            }
        }
        ready
    }
}

impl Default for OrderedQueue {
    fn default() -> Self {
        Self::new()
    }
}
