//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: worker threads started, including replacements.
pub fn workers_spawned() -> Counter<u64> {
    meter()
        .u64_counter("batchq.worker.spawned")
        .with_description("Number of worker threads started")
        .build()
}

/// Counter: dead workers replaced by the watch loop.
pub fn worker_respawns() -> Counter<u64> {
    meter()
        .u64_counter("batchq.worker.respawns")
        .with_description("Number of dead workers replaced")
        .build()
}

/// Counter: items acknowledged by a worker.
/// Labels: `model`.
pub fn items_completed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.item.completed")
        .with_description("Number of items processed successfully")
        .build()
}

/// Counter: in-process retries after a transient failure.
pub fn item_retries() -> Counter<u64> {
    meter()
        .u64_counter("batchq.item.retries")
        .with_description("Number of transient item failures retried in place")
        .build()
}

/// Counter: items put back on the queue after a fatal failure.
pub fn items_requeued() -> Counter<u64> {
    meter()
        .u64_counter("batchq.item.requeued")
        .with_description("Number of items requeued after a fatal failure")
        .build()
}

/// Histogram: time from dequeue to acknowledgment, in milliseconds.
/// Labels: `model`.
pub fn item_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.item.duration_ms")
        .with_description("Item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: task runner jobs settled.
/// Labels: `result` ("ok" | "error").
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.job.completed")
        .with_description("Number of task runner jobs settled")
        .build()
}
