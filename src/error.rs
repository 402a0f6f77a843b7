//! Error types for batchq.

use thiserror::Error;

use crate::engine::processor::ProcessError;
use crate::model::WorkerState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no model has been selected for new submissions")]
    NoModelSelected,

    #[error("progress has not been configured")]
    ProgressNotConfigured,

    #[error("invalid worker state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("task_done() called more times than items were enqueued")]
    QueueUnderflow,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("job cancelled before completion")]
    Cancelled,

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("processing failed: {0}")]
    Process(#[from] ProcessError),

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad pipeline file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("bad worker message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
