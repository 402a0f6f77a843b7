//! # batchq
//!
//! Batch file processing with two execution engines.
//!
//! - [`runner::TaskRunner`] runs many small async jobs with bounded
//!   concurrency and one progress line.
//! - [`engine::WorkerPool`] keeps a fixed set of long-lived workers, each
//!   holding one expensive loaded model (in a worker process of its own, or
//!   in the worker thread), fed from a [`queue::DurableQueue`]. A worker that
//!   fails an item puts it back before acknowledging it and dies; the pool's
//!   watch loop replaces it, so every submitted item is eventually processed.
//!
//! [`pipeline`] chains both engines over a directory of files.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod telemetry;

pub use error::{Error, Result};
