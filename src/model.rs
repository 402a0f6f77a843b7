//! Core data model.
//!
//! A work item is one file to push through one model. Workers are long-lived,
//! hold a single loaded model and walk a small state machine for every item
//! they take off the queue.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Model tag
// ---------------------------------------------------------------------------

/// Identifies the expensive, swappable resource a worker must have loaded
/// to process an item (a model file name, a preset, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelTag(String);

impl ModelTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModelTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for ModelTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl std::fmt::Display for ModelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

/// One unit of worker-pool work. Immutable once built.
///
/// Carries no processing history: a redelivered item is indistinguishable
/// from the first delivery, so processors must overwrite their output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    input_dir: PathBuf,
    output_dir: PathBuf,
    file_key: String,
    model: ModelTag,
}

impl WorkItem {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        file_key: impl Into<String>,
        model: ModelTag,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            file_key: file_key.into(),
            model,
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Relative path of the file, also the designated output key.
    pub fn file_key(&self) -> &str {
        &self.file_key
    }

    pub fn model(&self) -> &ModelTag {
        &self.model
    }

    pub fn input_path(&self) -> PathBuf {
        self.input_dir.join(&self.file_key)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_key)
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Identity of one worker incarnation. A respawned worker gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Per-item lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting on the queue.
    Idle,
    /// Swapping in the model the next item needs.
    Loading,
    /// Running the item, with in-process retries for transient errors.
    Processing,
    /// Counting the item as completed and acknowledging it.
    Acknowledging,
    /// Requeueing the item before the worker exits. Terminal.
    Failing,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Loading)
                | (Idle, Processing)    // model already loaded
                | (Idle, Failing)       // panic before the first transition
                | (Loading, Processing)
                | (Loading, Failing)
                | (Processing, Acknowledging)
                | (Processing, Failing)
                | (Acknowledging, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Failing)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Loading => "loading",
            WorkerState::Processing => "processing",
            WorkerState::Acknowledging => "acknowledging",
            WorkerState::Failing => "failing",
        };
        write!(f, "{s}")
    }
}
