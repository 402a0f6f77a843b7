//! Crash-tolerant work queue with a join barrier.
//!
//! Every `put` raises the unfinished counter and every `task_done` lowers it,
//! so `join` returns only once each enqueued item has been acknowledged.
//! `requeue` puts an item back and acknowledges the failed delivery under a
//! single lock, which leaves the counter unchanged and never lets it dip
//! below the true number of outstanding items.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Counters observed at one instant. `unfinished == enqueued - acknowledged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub enqueued: u64,
    pub acknowledged: u64,
    pub unfinished: u64,
    /// Items waiting to be dequeued (excludes items in flight).
    pub pending: u64,
}

/// Multi-producer, multi-consumer queue shared by the pool and its workers.
pub struct DurableQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    drained: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    enqueued: u64,
    acknowledged: u64,
}

impl<T> QueueState<T> {
    fn unfinished(&self) -> u64 {
        self.enqueued - self.acknowledged
    }
}

impl<T> DurableQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                enqueued: 0,
                acknowledged: 0,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item and count it as unfinished.
    pub fn put(&self, item: T) {
        let mut state = self.lock();
        state.items.push_back(item);
        state.enqueued += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Dequeue the oldest item, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.items.pop_front()
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Acknowledge one previously dequeued item.
    pub fn task_done(&self) -> Result<()> {
        let mut state = self.lock();
        if state.unfinished() == 0 {
            return Err(Error::QueueUnderflow);
        }
        state.acknowledged += 1;
        let drained = state.unfinished() == 0;
        drop(state);
        if drained {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Put a failed item back, then acknowledge the failed delivery.
    ///
    /// Both steps happen under one lock, so no observer ever sees the
    /// unfinished counter change.
    pub fn requeue(&self, item: T) -> Result<()> {
        let mut state = self.lock();
        if state.unfinished() == 0 {
            return Err(Error::QueueUnderflow);
        }
        state.items.push_back(item);
        state.enqueued += 1;
        state.acknowledged += 1;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until every enqueued item has been acknowledged.
    pub fn join(&self) {
        let state = self.lock();
        let _state = self
            .drained
            .wait_while(state, |s| s.unfinished() > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`join`](Self::join), giving up after `timeout`.
    /// Returns `true` if the queue drained in time.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.unfinished() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .drained
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn unfinished(&self) -> u64 {
        self.lock().unfinished()
    }

    pub fn pending(&self) -> u64 {
        self.lock().items.len() as u64
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            enqueued: state.enqueued,
            acknowledged: state.acknowledged,
            unfinished: state.unfinished(),
            pending: state.items.len() as u64,
        }
    }
}

impl<T> Default for DurableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
