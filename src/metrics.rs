//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Documents read, written, failed and denied
//! - Batch processing
//! - Change feed requests
//! - Checkpoint writes
//! - Restarts and task state
//!
//! The library never installs a recorder; without one these calls are no-ops.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and labelled with
//! `replication_id` (the checkpoint id without its `_local/` prefix):
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replicator::metrics;
//! use std::time::Duration;
//!
//! // After a batch finished
//! metrics::record_batch("3f2a...", 100, Duration::from_millis(40));
//! metrics::record_docs_written("3f2a...", 98);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Documents fetched from the source.
pub fn record_docs_read(replication_id: &str, count: usize) {
    counter!("replication_docs_read_total", "replication_id" => replication_id.to_string())
        .increment(count as u64);
}

/// Documents the target accepted.
pub fn record_docs_written(replication_id: &str, count: usize) {
    counter!("replication_docs_written_total", "replication_id" => replication_id.to_string())
        .increment(count as u64);
}

/// Documents the target rejected.
pub fn record_doc_write_failures(replication_id: &str, count: usize) {
    if count > 0 {
        counter!(
            "replication_doc_write_failures_total",
            "replication_id" => replication_id.to_string()
        )
        .increment(count as u64);
    }
}

/// Documents the target refused for authorization reasons.
pub fn record_doc_denied(replication_id: &str) {
    counter!("replication_docs_denied_total", "replication_id" => replication_id.to_string())
        .increment(1);
}

// =============================================================================
// Batch Processing Metrics
// =============================================================================

/// A batch ran from diff to checkpoint.
pub fn record_batch(replication_id: &str, changes: usize, duration: Duration) {
    let id = replication_id.to_string();
    counter!("replication_batches_total", "replication_id" => id.clone()).increment(1);
    histogram!("replication_batch_duration_seconds", "replication_id" => id.clone())
        .record(duration.as_secs_f64());
    histogram!("replication_batch_size", "replication_id" => id).record(changes as f64);
}

/// Batches waiting in the FIFO.
pub fn set_queue_depth(replication_id: &str, depth: usize) {
    gauge!("replication_queued_batches", "replication_id" => replication_id.to_string())
        .set(depth as f64);
}

// =============================================================================
// Feed / Checkpoint Metrics
// =============================================================================

/// A change feed page or live tail was requested.
pub fn record_changes_request(replication_id: &str, live: bool) {
    let mode = if live { "live" } else { "page" };
    counter!(
        "replication_changes_requests_total",
        "replication_id" => replication_id.to_string(),
        "mode" => mode
    )
    .increment(1);
}

/// Record checkpoint persistence.
pub fn record_checkpoint_write(replication_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_writes_total",
        "replication_id" => replication_id.to_string(),
        "status" => status
    )
    .increment(1);
}

// =============================================================================
// Lifecycle Metrics
// =============================================================================

/// An attempt failed and the task is backing off before restarting.
pub fn record_restart(replication_id: &str, error_name: &str) {
    counter!(
        "replication_restarts_total",
        "replication_id" => replication_id.to_string(),
        "error" => error_name.to_string()
    )
    .increment(1);
}

/// Gauge for task state.
pub fn set_task_state(replication_id: &str, state: &str) {
    // Numeric encoding for alerting.
    let value = match state {
        "pending" => 0.0,
        "active" => 1.0,
        "stopped" => 2.0,
        "cancelled" => 3.0,
        "complete" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_task_state", "replication_id" => replication_id.to_string()).set(value);
}
