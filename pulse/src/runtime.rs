//! Runtime sampler and leak detection.
//!
//! A timer loop captures heap counters, process RSS and tokio task counts
//! into [`RuntimeSample`]s, broadcasts each sample, and feeds the leak
//! detector. The detector watches task-count growth over a trailing hour;
//! sustained growth beyond the configured rate flags a leak, the async
//! analogue of a goroutine leak.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::alloc;
use crate::model::RuntimeSample;

/// Capture a sample of the current process.
pub(crate) fn capture_sample() -> RuntimeSample {
    let heap = alloc::heap_stats();
    let (tasks, workers) = runtime_counts();

    RuntimeSample {
        heap_alloc_bytes: heap.live_bytes,
        heap_in_use_bytes: heap.peak_bytes,
        heap_objects: heap.live_allocations,
        total_alloc_bytes: heap.total_allocated,
        rss_bytes: rss_bytes(),
        tasks,
        workers,
        timestamp: Utc::now(),
    }
}

fn runtime_counts() -> (u64, u64) {
    tokio::runtime::Handle::try_current().map_or((0, 0), |handle| {
        let metrics = handle.metrics();
        (
            metrics.num_alive_tasks() as u64,
            metrics.num_workers() as u64,
        )
    })
}

/// Resident set size from `/proc/self/status`; zero where unavailable.
#[cfg(target_os = "linux")]
fn rss_bytes() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> u64 {
    0
}

// ============================================================================
// Leak detection
// ============================================================================

/// Minimum observation span before growth is meaningful.
const MIN_SPAN: Duration = Duration::minutes(10);
/// Trailing history horizon.
const HISTORY: Duration = Duration::hours(1);

/// Watches task-count growth over a bounded trailing window.
pub struct LeakDetector {
    threshold_per_hour: f64,
    history: Mutex<VecDeque<(DateTime<Utc>, u64)>>,
}

impl LeakDetector {
    pub fn new(threshold_per_hour: f64) -> Self {
        Self {
            threshold_per_hour,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a sample and trim history older than one hour.
    pub fn observe(&self, at: DateTime<Utc>, tasks: u64) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back((at, tasks));
        let cutoff = at - HISTORY;
        while history.front().is_some_and(|(t, _)| *t < cutoff) {
            history.pop_front();
        }
    }

    /// Growth rate per hour across the observed window.
    ///
    /// `None` until at least two samples span ten minutes.
    pub fn growth_per_hour(&self) -> Option<f64> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let (first_at, first) = *history.front()?;
        let (last_at, last) = *history.back()?;
        let span = last_at - first_at;
        if span < MIN_SPAN {
            return None;
        }
        let hours = span.num_milliseconds() as f64 / 3_600_000.0;
        Some((last as f64 - first as f64) / hours)
    }

    /// Whether growth currently exceeds the configured rate.
    pub fn is_leaking(&self) -> bool {
        self.growth_per_hour()
            .is_some_and(|rate| rate >= self.threshold_per_hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_ten_minutes_of_history() {
        let detector = LeakDetector::new(100.0);
        let now = Utc::now();
        detector.observe(now, 10);
        detector.observe(now + Duration::minutes(5), 500);
        assert!(detector.growth_per_hour().is_none());
        assert!(!detector.is_leaking());
    }

    #[test]
    fn computes_growth_rate() {
        let detector = LeakDetector::new(100.0);
        let now = Utc::now();
        detector.observe(now, 100);
        detector.observe(now + Duration::minutes(30), 200);
        // +100 tasks in 30 minutes = 200/hr.
        let rate = detector.growth_per_hour().unwrap();
        assert!((rate - 200.0).abs() < 1.0);
        assert!(detector.is_leaking());
    }

    #[test]
    fn stable_count_is_not_a_leak() {
        let detector = LeakDetector::new(100.0);
        let now = Utc::now();
        detector.observe(now, 50);
        detector.observe(now + Duration::minutes(20), 52);
        assert!(!detector.is_leaking());
    }

    #[test]
    fn shrinking_count_is_negative_growth() {
        let detector = LeakDetector::new(100.0);
        let now = Utc::now();
        detector.observe(now, 500);
        detector.observe(now + Duration::minutes(30), 100);
        assert!(detector.growth_per_hour().unwrap() < 0.0);
        assert!(!detector.is_leaking());
    }

    #[test]
    fn history_is_trimmed_to_an_hour() {
        let detector = LeakDetector::new(100.0);
        let start = Utc::now();
        detector.observe(start, 1_000_000);
        detector.observe(start + Duration::minutes(90), 100);
        detector.observe(start + Duration::minutes(100), 110);
        // The first sample fell out of the window; growth reflects only the
        // last two.
        let rate = detector.growth_per_hour().unwrap();
        assert!(rate > 0.0 && rate < 100.0, "rate = {rate}");
    }

    #[test]
    fn sample_capture_is_total() {
        // Outside a tokio runtime the task counts read zero and the call
        // still succeeds.
        let sample = capture_sample();
        assert!(sample.timestamp <= Utc::now());
    }
}
