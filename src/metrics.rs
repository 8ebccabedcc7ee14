// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Records through the `metrics` facade; no exporter is installed by the
//! library, so these calls are no-ops until the host process installs one.
//!
//! - Consumption (messages consumed/skipped, commits, reconnects)
//! - Batching (flush size/duration, pending records)
//! - Replica writes (per store outcome, retries, dead letters)
//! - Publishing and export paging
//! - Reconciliation match rate
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `order_replication_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use order_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_message_consumed("replica-a");
//! metrics::record_batch_flush("replica-a", "size", 1000, Duration::from_millis(85));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Consumption
// =============================================================================

/// Record a message appended to the batch.
pub fn record_message_consumed(group_id: &str) {
    counter!("order_replication_messages_consumed_total", "group_id" => group_id.to_string())
        .increment(1);
}

/// Record a message that was not replicated (`empty` or `decode_error`).
pub fn record_message_skipped(group_id: &str, reason: &str) {
    counter!(
        "order_replication_messages_skipped_total",
        "group_id" => group_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a failed offset commit.
pub fn record_commit_failure(group_id: &str) {
    counter!("order_replication_commit_failures_total", "group_id" => group_id.to_string())
        .increment(1);
}

/// Record the consumer being torn down and resubscribed.
pub fn record_consumer_reconnect(group_id: &str) {
    counter!("order_replication_consumer_reconnects_total", "group_id" => group_id.to_string())
        .increment(1);
}

/// Record a partition assignment change.
pub fn record_rebalance(group_id: &str, kind: &str, partitions: usize) {
    counter!(
        "order_replication_rebalances_total",
        "group_id" => group_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    gauge!("order_replication_rebalance_partitions", "group_id" => group_id.to_string())
        .set(partitions as f64);
}

// =============================================================================
// Batching
// =============================================================================

/// Record a non-empty batch flush and what triggered it.
pub fn record_batch_flush(pipeline: &str, trigger: &str, size: usize, duration: Duration) {
    counter!(
        "order_replication_batch_flushes_total",
        "pipeline" => pipeline.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
    histogram!("order_replication_batch_size", "pipeline" => pipeline.to_string())
        .record(size as f64);
    histogram!("order_replication_batch_flush_duration_seconds", "pipeline" => pipeline.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for records buffered and not yet flushed.
pub fn set_pending_records(pipeline: &str, count: usize) {
    gauge!("order_replication_pending_records", "pipeline" => pipeline.to_string())
        .set(count as f64);
}

// =============================================================================
// Replica writes
// =============================================================================

/// Record one store's batch write outcome (`success` or `failure`).
pub fn record_sink_write(store: &str, success: bool, records: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "order_replication_sink_writes_total",
        "store" => store.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!("order_replication_sink_records_total", "store" => store.to_string())
            .increment(records as u64);
    }
    histogram!("order_replication_sink_write_duration_seconds", "store" => store.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retried store write.
pub fn record_sink_retry(store: &str) {
    counter!("order_replication_sink_retries_total", "store" => store.to_string()).increment(1);
}

/// Record records handed to the dead-letter directory.
pub fn record_dead_letter(store: &str, records: usize) {
    counter!("order_replication_dead_letter_records_total", "store" => store.to_string())
        .increment(records as u64);
}

/// Record records lost because no dead-letter directory is configured.
pub fn record_dropped_records(store: &str, records: usize) {
    counter!("order_replication_dropped_records_total", "store" => store.to_string())
        .increment(records as u64);
}

// =============================================================================
// Publishing and export
// =============================================================================

/// Record a publish outcome and how many attempts it took.
pub fn record_publish(topic: &str, success: bool, attempts: u32) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "order_replication_publishes_total",
        "topic" => topic.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("order_replication_publish_attempts", "topic" => topic.to_string())
        .record(attempts as f64);
}

/// Record an export page that was fetched and fully attempted.
pub fn record_export_page(topic: &str, records: usize, duration: Duration) {
    counter!("order_replication_export_pages_total", "topic" => topic.to_string()).increment(1);
    counter!("order_replication_export_records_total", "topic" => topic.to_string())
        .increment(records as u64);
    histogram!("order_replication_export_page_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Record export cursor persistence.
pub fn record_cursor_persist(topic: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "order_replication_cursor_persists_total",
        "topic" => topic.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("order_replication_cursor_retries_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Gauge for the latest match percentage of a replica topology.
pub fn set_match_percentage(replica: &str, percentage: f64) {
    gauge!("order_replication_match_percentage", "replica" => replica.to_string()).set(percentage);
}

/// Gauge for reference records absent from a replica.
pub fn set_missing_records(replica: &str, count: usize) {
    gauge!("order_replication_missing_records", "replica" => replica.to_string())
        .set(count as f64);
}

// =============================================================================
// Pipeline lifecycle
// =============================================================================

/// Gauge for pipeline state.
pub fn set_pipeline_state(pipeline: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("order_replication_pipeline_state", "pipeline" => pipeline.to_string()).set(value);
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "order_replication_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
