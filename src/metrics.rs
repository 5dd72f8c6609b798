// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for docsync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding pipeline is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `docsync_` prefix for all metrics
//! - `_total` suffix for counters
//!
//! # Labels
//! - `resource`: the loader's resource label
//! - `reason`: rejection reason (destroyed, circuit_open)

use metrics::{counter, gauge};

/// Record a loader cache hit for a resource type
pub fn record_cache_hit(resource: &str) {
    counter!(
        "docsync_cache_hits_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Record a loader upstream fetch for a resource type
pub fn record_fetch(resource: &str) {
    counter!(
        "docsync_fetches_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Record a task admitted from the scheduler queue
pub fn record_task_admitted() {
    counter!("docsync_tasks_admitted_total").increment(1);
}

/// Record a task rejected before execution
pub fn record_task_rejected(reason: &str) {
    counter!(
        "docsync_tasks_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set the current scheduler queue depth
pub fn set_queue_depth(depth: usize) {
    gauge!("docsync_queue_depth").set(depth as f64);
}
