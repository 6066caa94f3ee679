//! N+1 query detection.
//!
//! Counts identical normalized query patterns per request trace. The exact
//! moment a pattern's repetition count crosses the configured threshold, one
//! detection is emitted for that `(trace, pattern)` pair; it never fires
//! twice within the same request. Tracking state for a trace is dropped when
//! its request completes.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;

use crate::model::N1Detection;

#[derive(Debug, Default)]
struct PatternCount {
    count: u32,
    total_ms: f64,
}

/// Per-trace pattern counters.
pub struct N1Tracker {
    threshold: u32,
    traces: DashMap<String, HashMap<String, PatternCount>>,
}

impl N1Tracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(2),
            traces: DashMap::new(),
        }
    }

    /// Record one query occurrence. Returns a detection exactly when the
    /// pattern's count reaches the threshold.
    pub fn record(
        &self,
        trace_id: &str,
        route: &str,
        pattern: &str,
        duration_ms: f64,
    ) -> Option<N1Detection> {
        if trace_id.is_empty() || pattern.is_empty() {
            return None;
        }

        let mut patterns = self.traces.entry(trace_id.to_string()).or_default();
        let entry = patterns.entry(pattern.to_string()).or_default();
        entry.count += 1;
        entry.total_ms += duration_ms;

        (entry.count == self.threshold).then(|| N1Detection {
            pattern: pattern.to_string(),
            count: entry.count,
            total_duration_ms: entry.total_ms,
            trace_id: trace_id.to_string(),
            route: route.to_string(),
            detected_at: Utc::now(),
        })
    }

    /// Drop all tracking state for a finished request.
    pub fn finish_trace(&self, trace_id: &str) {
        self.traces.remove(trace_id);
    }

    /// Number of traces currently tracked. Test hook.
    #[cfg(test)]
    fn tracked_traces(&self) -> usize {
        self.traces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = "select * from posts where id = ?";

    #[test]
    fn fires_exactly_once_at_threshold() {
        let tracker = N1Tracker::new(5);
        let mut detections = Vec::new();
        for _ in 0..10 {
            if let Some(d) = tracker.record("t1", "/posts", PATTERN, 2.0) {
                detections.push(d);
            }
        }
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.count, 5);
        assert_eq!(d.trace_id, "t1");
        assert_eq!(d.pattern, PATTERN);
        assert!((d.total_duration_ms - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn never_fires_for_empty_trace() {
        let tracker = N1Tracker::new(2);
        for _ in 0..10 {
            assert!(tracker.record("", "/x", PATTERN, 1.0).is_none());
        }
    }

    #[test]
    fn distinct_patterns_count_separately() {
        let tracker = N1Tracker::new(3);
        for _ in 0..2 {
            assert!(tracker.record("t1", "/x", "select a from t where id = ?", 1.0).is_none());
            assert!(tracker.record("t1", "/x", "select b from t where id = ?", 1.0).is_none());
        }
        let a = tracker.record("t1", "/x", "select a from t where id = ?", 1.0);
        assert!(a.is_some());
    }

    #[test]
    fn distinct_traces_count_separately() {
        let tracker = N1Tracker::new(3);
        for _ in 0..2 {
            tracker.record("t1", "/x", PATTERN, 1.0);
            tracker.record("t2", "/x", PATTERN, 1.0);
        }
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_some());
        assert!(tracker.record("t2", "/x", PATTERN, 1.0).is_some());
    }

    #[test]
    fn finish_trace_clears_state() {
        let tracker = N1Tracker::new(3);
        tracker.record("t1", "/x", PATTERN, 1.0);
        tracker.record("t1", "/x", PATTERN, 1.0);
        tracker.finish_trace("t1");
        assert_eq!(tracker.tracked_traces(), 0);

        // Counting restarts after the sweep.
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_none());
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_none());
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_some());
    }

    #[test]
    fn threshold_is_clamped_to_at_least_two() {
        let tracker = N1Tracker::new(0);
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_none());
        assert!(tracker.record("t1", "/x", PATTERN, 1.0).is_some());
    }
}
