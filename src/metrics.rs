//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - KV request outcomes and local retries
//! - Reconciliation throughput and latency
//! - Index fan-out sizes
//! - Dispatch queue sweeps and publish failures
//! - Durable retry jobs and dead letters
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use crate::queue::SweepStats;
use metrics::{counter, histogram};
use std::time::Duration;

/// Record the outcome of a KV request (after local retries).
pub fn record_kv_request(operation: &str, outcome: &str) {
    counter!("mirror_kv_requests_total", "operation" => operation.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record one local KV retry (transient status or transport error).
pub fn record_kv_retry(operation: &str) {
    counter!("mirror_kv_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a KV operation whose local retry budget was spent.
pub fn record_kv_retries_exhausted(operation: &str) {
    counter!("mirror_kv_retries_exhausted_total", "operation" => operation.to_string()).increment(1);
}

/// Record a completed reconciliation and its duration.
pub fn record_reconcile(kind: &str, duration: Duration) {
    counter!("mirror_reconcile_total", "kind" => kind.to_string()).increment(1);
    histogram!("mirror_reconcile_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record the size of one index fan-out (writes or deletes).
pub fn record_index_fanout(kind: &str, count: usize) {
    if count > 0 {
        counter!("mirror_index_keys_total", "kind" => kind.to_string()).increment(count as u64);
        histogram!("mirror_index_fanout_size", "kind" => kind.to_string()).record(count as f64);
    }
}

/// Record a safe operation converting a KV failure into a retry job.
pub fn record_safe_op_failure(operation: &str) {
    counter!("mirror_safe_op_failures_total", "operation" => operation.to_string()).increment(1);
}

/// Record a retry job successfully enqueued.
pub fn record_retry_enqueued(operation: &str) {
    counter!("mirror_retry_enqueued_total", "operation" => operation.to_string()).increment(1);
}

/// Record the double-failure case: a retry job that could not be enqueued.
pub fn record_retry_enqueue_failed() {
    counter!("mirror_retry_enqueue_failures_total").increment(1);
}

/// Record a dispatch entry inserted into the queue.
pub fn record_dispatch_enqueued(topic: &str) {
    counter!("mirror_dispatch_enqueued_total", "topic" => topic.to_string()).increment(1);
}

/// Record a dispatch entry published to the bus.
pub fn record_dispatch_published(topic: &str) {
    counter!("mirror_dispatch_published_total", "topic" => topic.to_string()).increment(1);
}

/// Record a malformed dispatch entry dropped by the sweeper.
pub fn record_dispatch_malformed() {
    counter!("mirror_dispatch_malformed_total").increment(1);
}

/// Record a failed publish attempt.
pub fn record_publish_failure(topic: &str) {
    counter!("mirror_publish_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record a dead-lettered operation.
pub fn record_dead_letter(topic: &str) {
    counter!("mirror_dead_letters_total", "topic" => topic.to_string()).increment(1);
}

/// Record a completed sweep pass.
pub fn record_sweep(stats: &SweepStats) {
    counter!("mirror_sweeps_total").increment(1);
    if stats.scanned > 0 {
        counter!("mirror_sweep_entries_total", "outcome" => "published")
            .increment(stats.published as u64);
        counter!("mirror_sweep_entries_total", "outcome" => "rescheduled")
            .increment(stats.rescheduled as u64);
        counter!("mirror_sweep_entries_total", "outcome" => "dead_lettered")
            .increment(stats.dead_lettered as u64);
        counter!("mirror_sweep_entries_total", "outcome" => "malformed")
            .increment(stats.dropped_malformed as u64);
        counter!("mirror_sweep_entries_total", "outcome" => "skipped")
            .increment(stats.skipped as u64);
    }
}

/// Record a dispatch store retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_dispatch_store_retry(operation: &str) {
    counter!("mirror_dispatch_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a retry worker message outcome.
pub fn record_retry_job(topic: &str, outcome: &str) {
    counter!("mirror_retry_jobs_total", "topic" => topic.to_string(), "outcome" => outcome.to_string()).increment(1);
}
