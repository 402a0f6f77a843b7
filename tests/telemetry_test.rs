//! Integration tests for telemetry initialization and span helpers.

use batchq::model::{ModelTag, WorkItem, WorkerId, WorkerState};
use batchq::telemetry::{TelemetryConfig, init_telemetry, metrics, work};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process, so a
    // second attempt returning Err is acceptable here.
    let config = TelemetryConfig::new("batchq-test");
    assert!(config.endpoint.is_none());
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn item_span_records_transitions() {
    let worker_id = WorkerId::new();
    let item = WorkItem::new("in", "out", "01.flac", ModelTag::from("A"));

    let worker_span = work::start_worker_span(&worker_id);
    let _enter = worker_span.enter();
    let span = work::start_item_span(&worker_id, &item);
    work::record_state_transition(&span, WorkerState::Idle, WorkerState::Loading);
    work::record_state_transition(&span, WorkerState::Loading, WorkerState::Processing);
}

#[test]
fn instruments_are_usable_without_a_provider() {
    metrics::workers_spawned().add(1, &[]);
    metrics::items_completed().add(1, &[]);
    metrics::item_duration_ms().record(12.5, &[]);
    metrics::jobs_completed().add(1, &[opentelemetry::KeyValue::new("result", "ok")]);
}
