//! Worker and item span helpers.
//!
//! Every worker thread runs inside a `worker` span; every item it takes off
//! the queue gets a child `item.process` span whose state transitions are
//! recorded as events.

use tracing::Span;

use crate::model::{WorkItem, WorkerId, WorkerState};

/// Start the long-lived span for one worker incarnation.
pub fn start_worker_span(worker_id: &WorkerId) -> Span {
    tracing::info_span!("worker", "worker.id" = %worker_id)
}

/// Start a span for processing one item.
///
/// The `worker.state` field is declared empty and is updated by
/// [`record_state_transition`].
pub fn start_item_span(worker_id: &WorkerId, item: &WorkItem) -> Span {
    tracing::info_span!(
        "item.process",
        "worker.id" = %worker_id,
        "item.file_key" = item.file_key(),
        "item.model" = %item.model(),
        "worker.state" = tracing::field::Empty,
    )
}

/// Record a worker state transition on the given span.
pub fn record_state_transition(span: &Span, from: WorkerState, to: WorkerState) {
    span.record("worker.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
