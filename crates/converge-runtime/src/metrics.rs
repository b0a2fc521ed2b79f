//! Metric recording helpers
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! every call is a no-op, so the runtime can record unconditionally.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

/// Record a finished reconciliation and its outcome label.
pub fn record_reconcile(outcome: &'static str, duration: Duration) {
    counter!("converge_reconcile_total", "result" => outcome).increment(1);
    histogram!("converge_reconcile_duration_seconds", "result" => outcome)
        .record(duration.as_secs_f64());
}

/// Current number of keys ready to be handed to a worker.
pub fn set_queue_depth(depth: usize) {
    gauge!("converge_workqueue_depth").set(depth as f64);
}

/// A key was scheduled through the rate limiter.
pub fn record_retry() {
    counter!("converge_workqueue_retries_total").increment(1);
}

/// An event accepted into the cache.
pub fn record_watch_event(kind: &'static str) {
    counter!("converge_watch_events_total", "type" => kind).increment(1);
}

/// A full relist of the watched collection.
pub fn record_relist() {
    counter!("converge_watch_relists_total").increment(1);
}

/// 1 while this replica holds the lease, 0 otherwise.
pub fn set_leader(is_leader: bool) {
    gauge!("converge_leader").set(if is_leader { 1.0 } else { 0.0 });
}
