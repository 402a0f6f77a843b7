//! Structured events emitted by the worker pool.
//!
//! The pool records every supervision decision and item outcome here so
//! callers can audit a run (how many respawns, which items were redelivered)
//! without scraping logs. Only the most recent events are retained.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ModelTag, WorkerId};

/// Events retained by default before the oldest are dropped.
pub const DEFAULT_RETAINED_EVENTS: usize = 4096;

/// A structured event emitted by the pool or one of its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkerStarted {
        worker_id: WorkerId,
    },
    WorkerDied {
        worker_id: WorkerId,
        reason: String,
    },
    WorkerRespawned {
        dead: WorkerId,
        replacement: WorkerId,
    },
    ModelLoaded {
        worker_id: WorkerId,
        model: ModelTag,
    },
    ItemRetried {
        worker_id: WorkerId,
        file_key: String,
        attempt: u32,
        error: String,
    },
    ItemRequeued {
        worker_id: WorkerId,
        file_key: String,
        error: String,
    },
    ItemCompleted {
        worker_id: WorkerId,
        file_key: String,
    },
    StageConfigured {
        total: u64,
        visible: bool,
    },
}

/// Bounded, thread-safe event log.
pub struct EventLog {
    inner: Mutex<LogState>,
    capacity: usize,
}

struct LogState {
    next_seq: u64,
    events: VecDeque<Event>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogState {
                next_seq: 1,
                events: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest one when full.
    pub fn record(&self, kind: EventKind) -> u64 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.events.len() == self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
        seq
    }

    /// Retained events with `seq > since_seq`, oldest first.
    pub fn since(&self, since_seq: u64) -> Vec<Event> {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .events
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Count retained events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.events.iter().filter(|e| predicate(&e.kind)).count()
    }

    /// Sequence number of the most recent event, 0 if none.
    pub fn last_seq(&self) -> u64 {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_seq - 1
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETAINED_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_events_are_evicted_but_seq_keeps_growing() {
        let log = EventLog::new(2);
        for total in 1..=3 {
            log.record(EventKind::StageConfigured {
                total,
                visible: true,
            });
        }

        let events = log.since(0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].seq, 3);
        assert_eq!(log.last_seq(), 3);
    }

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let kind = EventKind::StageConfigured {
            total: 4,
            visible: false,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "stage_configured");
        assert_eq!(json["total"], 4);
    }
}
