//! Bounded circular buffer for telemetry streams.
//!
//! Each telemetry stream (requests, queries, runtime samples, health results,
//! dependency calls) owns one `RingBuffer`. Writers never block on a full
//! buffer: the newest record overwrites the logically oldest slot. Readers
//! take the slot lock for the duration of a traversal, so they always observe
//! a consistent set of elements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A fixed-capacity, multi-producer circular buffer.
///
/// Writers reserve a slot by atomically advancing a monotonically increasing
/// head counter, then write the slot under a short lock. When the buffer is
/// full, the oldest element is overwritten; elements are never dropped from
/// the middle.
pub struct RingBuffer<T> {
    capacity: usize,
    /// Total number of pushes ever started. The live window is
    /// `[head - capacity, head)` once the buffer has wrapped.
    head: AtomicU64,
    slots: Mutex<Vec<Option<T>>>,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` elements.
    ///
    /// A zero capacity is clamped to one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            head: AtomicU64::new(0),
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Append an element, overwriting the oldest when full. Never blocks on
    /// capacity.
    pub fn push(&self, item: T) {
        let seq = self.head.fetch_add(1, Ordering::AcqRel);
        let idx = (seq % self.capacity as u64) as usize;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[idx] = Some(item);
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        head.min(self.capacity as u64) as usize
    }

    /// True when nothing has been pushed since creation or the last reset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of elements the buffer retains.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-first copy of the live contents.
    pub fn snapshot(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|item| {
            out.push(item.clone());
            true
        });
        out
    }

    /// Up to `n` newest elements, newest first.
    pub fn last(&self, n: usize) -> Vec<T> {
        let mut all = self.snapshot();
        all.reverse();
        all.truncate(n);
        all
    }

    /// Oldest-first traversal. The callback returns `false` to stop early.
    ///
    /// The traversal holds the slot lock, so concurrent pushes wait until it
    /// finishes; the callback must be cheap.
    pub fn for_each(&self, mut f: impl FnMut(&T) -> bool) {
        let head = self.head.load(Ordering::Acquire);
        let start = head.saturating_sub(self.capacity as u64);
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for seq in start..head {
            let idx = (seq % self.capacity as u64) as usize;
            if let Some(item) = &slots[idx] {
                if !f(item) {
                    return;
                }
            }
        }
    }

    /// Oldest-first elements matching `pred`.
    pub fn filter(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        self.for_each(|item| {
            if pred(item) {
                out.push(item.clone());
            }
            true
        });
        out
    }

    /// Clear all contents. `len()` is zero afterwards.
    pub fn reset(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            *slot = None;
        }
        self.head.store(0, Ordering::Release);
    }
}
