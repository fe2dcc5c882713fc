// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tag-cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tag_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `mode`: any, all (`pattern` for glob flushes)
//! - `strategy`: lazy, eager, generational
//! - `client`: cluster, pipelined
//! - `status`: success, partial, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a completed (or failed) tag flush
pub fn record_flush(mode: &str, strategy: &str, status: &str) {
    counter!(
        "tag_cache_flushes_total",
        "mode" => mode.to_string(),
        "strategy" => strategy.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, mode: &str, duration: Duration) {
    histogram!(
        "tag_cache_operation_seconds",
        "operation" => operation.to_string(),
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record values removed by a flush
pub fn record_keys_invalidated(mode: &str, count: u64) {
    counter!("tag_cache_keys_invalidated_total", "mode" => mode.to_string()).increment(count);
}

/// Record one delete batch and its key count
pub fn record_batch(client: &str, keys: usize) {
    counter!("tag_cache_batches_total", "client" => client.to_string()).increment(1);
    histogram!("tag_cache_batch_size", "client" => client.to_string()).record(keys as f64);
}

/// Record an UNLINK batch that failed and was skipped
pub fn record_unlink_failure(operation: &str) {
    counter!(
        "tag_cache_unlink_failures_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record membership fields removed from non-flushed tags
pub fn record_orphans_cleared(count: u64) {
    counter!("tag_cache_orphans_cleared_total").increment(count);
}

/// Record a prune pass
pub fn record_prune(mode: &str, fields_removed: u64, tags_removed: u64) {
    counter!("tag_cache_pruned_fields_total", "mode" => mode.to_string()).increment(fields_removed);
    counter!("tag_cache_pruned_tags_total", "mode" => mode.to_string()).increment(tags_removed);
}

/// Record a tagged write
pub fn record_write(mode: &str, status: &str) {
    counter!(
        "tag_cache_writes_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a tagged read
pub fn record_lookup(mode: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "tag_cache_lookups_total",
        "mode" => mode.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Record a failed connection attempt
pub fn record_connection_error(backend: &str) {
    counter!(
        "tag_cache_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record the outcome of one doctor check
pub fn record_doctor_check(check: &str, passed: bool) {
    let status = if passed { "passed" } else { "failed" };
    counter!(
        "tag_cache_doctor_checks_total",
        "check" => check.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set failed assertion count of the last doctor run
pub fn set_doctor_failures(count: usize) {
    gauge!("tag_cache_doctor_failures").set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    mode: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str, mode: &'static str) -> Self {
        Self {
            operation,
            mode,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.mode, self.start.elapsed());
    }
}
