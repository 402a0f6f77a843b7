//! Completion counter shared between workers and the watch loop.
//!
//! Workers only ever `increment`; the watch loop only ever `drain`s. The
//! drained amount is forwarded to the progress sink, so no completion is
//! counted twice and none is lost between polls.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct CompletionCounter {
    value: Mutex<u64>,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed item.
    pub fn increment(&self) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// Take the count accumulated since the last drain and reset it to zero.
    pub fn drain(&self) -> u64 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *value)
    }
}
