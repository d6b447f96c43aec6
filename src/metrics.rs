// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for flight-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `flight_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: indexed, quota, volatile, remote
//! - `operation`: store, load, clear, metadata, get, put, delete
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier or remote operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "flight_sync_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "flight_sync_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A tier stopped receiving writes for a user after quota exhaustion
pub fn record_tier_abandoned(tier: &str) {
    counter!(
        "flight_sync_tier_abandoned_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// A tier was cleared because its stored schema version is outdated
pub fn record_schema_rebuild(tier: &str) {
    counter!(
        "flight_sync_schema_rebuild_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// A tier was cleared by TTL cleanup or optimize
pub fn record_tier_evicted(tier: &str, reason: &str) {
    counter!(
        "flight_sync_tier_evicted_total",
        "tier" => tier.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set records cached in a tier (last observed)
pub fn set_tier_records(tier: &str, count: usize) {
    gauge!(
        "flight_sync_tier_records",
        "tier" => tier.to_string()
    )
    .set(count as f64);
}

/// Record a sync pass outcome: success, partial, failed, already_syncing
pub fn record_sync_pass(outcome: &str) {
    counter!(
        "flight_sync_sync_passes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_sync_duration(duration: Duration) {
    histogram!("flight_sync_sync_seconds").record(duration.as_secs_f64());
}

/// Queue entries replayed to the remote store
pub fn record_replayed(count: usize) {
    counter!("flight_sync_replayed_entries_total").increment(count as u64);
}

pub fn record_conflicts(detected: usize, resolved: usize) {
    counter!("flight_sync_conflicts_detected_total").increment(detected as u64);
    counter!("flight_sync_conflicts_resolved_total").increment(resolved as u64);
}

/// Set pending sync queue entries
pub fn set_queue_depth(count: usize) {
    gauge!("flight_sync_queue_depth").set(count as f64);
}

/// Record the result of a schedule import merge
pub fn record_merge(inserted: usize, updated: usize, removed: usize) {
    counter!("flight_sync_merge_inserted_total").increment(inserted as u64);
    counter!("flight_sync_merge_updated_total").increment(updated as u64);
    counter!("flight_sync_merge_removed_total").increment(removed as u64);
}

pub fn set_online(online: bool) {
    gauge!("flight_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Count engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "flight_sync_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Timer that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
