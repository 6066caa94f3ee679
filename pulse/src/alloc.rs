//! Opt-in heap tracking.
//!
//! Rust has no runtime heap introspection, so heap figures come from a
//! wrapping allocator the host installs explicitly:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: pulse::alloc::TrackedAlloc = pulse::alloc::TrackedAlloc::new();
//! ```
//!
//! Without it, [`heap_stats`] reads all zeros and the runtime sampler still
//! reports RSS and task counts.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static TOTAL_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static LIVE_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static PEAK_BYTES: AtomicU64 = AtomicU64::new(0);

/// A system-allocator wrapper that maintains global heap counters.
pub struct TrackedAlloc {
    inner: System,
}

impl TrackedAlloc {
    pub const fn new() -> Self {
        Self { inner: System }
    }
}

impl Default for TrackedAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TrackedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            let size = layout.size() as u64;
            TOTAL_ALLOCATED.fetch_add(size, Ordering::Relaxed);
            LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
            let live = LIVE_BYTES.fetch_add(size, Ordering::Relaxed) + size;
            // Racy peak update is fine; the counter only ever grows.
            let mut peak = PEAK_BYTES.load(Ordering::Relaxed);
            while live > peak {
                match PEAK_BYTES.compare_exchange_weak(
                    peak,
                    live,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(now) => peak = now,
                }
            }
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
        LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
        unsafe { self.inner.dealloc(ptr, layout) }
    }
}

/// Current heap counters; zeros when [`TrackedAlloc`] is not installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub total_allocated: u64,
    pub live_bytes: u64,
    pub live_allocations: u64,
    pub peak_bytes: u64,
}

/// Read the global heap counters.
pub fn heap_stats() -> HeapStats {
    HeapStats {
        total_allocated: TOTAL_ALLOCATED.load(Ordering::Relaxed),
        live_bytes: LIVE_BYTES.load(Ordering::Relaxed),
        live_allocations: LIVE_ALLOCATIONS.load(Ordering::Relaxed),
        peak_bytes: PEAK_BYTES.load(Ordering::Relaxed),
    }
}
