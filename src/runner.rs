//! Bounded task runner.
//!
//! Collects asynchronous jobs and runs at most `concurrency` of them at once
//! behind a counting semaphore. Every job advances the progress sink by one
//! when it settles, whether it succeeded, failed or panicked.
//!
//! Deferred jobs (the default) are polled together on the task that calls
//! [`TaskRunner::join`]. In immediate mode each job is spawned onto the tokio
//! runtime as soon as it is submitted.

use std::any::Any;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt as _};
use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::progress::{ProgressLine, ProgressSink};
use crate::telemetry::metrics;

/// Number of processing units on this host, at least 1.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

enum Job<E> {
    Deferred(BoxFuture<'static, Result<(), E>>),
    Spawned(JoinHandle<Result<(), E>>),
}

enum Settled<E> {
    Done(Result<(), E>),
    Panicked(Box<dyn Any + Send>),
}

/// Advances the sink by one when dropped, so a settled job is always counted.
struct AdvanceOnDrop(Arc<dyn ProgressSink>);

impl Drop for AdvanceOnDrop {
    fn drop(&mut self) {
        self.0.advance(1);
    }
}

/// Runs submitted jobs with bounded concurrency and waits for all of them.
///
/// `E` is the jobs' error type; it must be able to represent a runner
/// [`Error`] so that a cancelled job can still be reported.
pub struct TaskRunner<E = Error> {
    label: String,
    gate: Arc<Semaphore>,
    sink: Arc<dyn ProgressSink>,
    owns_sink: bool,
    immediate: bool,
    jobs: Vec<Job<E>>,
}

impl<E> TaskRunner<E>
where
    E: From<Error> + Send + 'static,
{
    /// A runner with its own hidden progress line.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let line = ProgressLine::new(label.clone());
        Self::build(label, Arc::new(line), true)
    }

    /// A runner reporting into an existing sink. The sink is left visible
    /// after `join` so the caller decides when to hide it.
    pub fn with_sink(label: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self::build(label.into(), sink, false)
    }

    fn build(label: String, sink: Arc<dyn ProgressSink>, owns_sink: bool) -> Self {
        // Counting starts here rather than in `join` so that immediate jobs
        // finishing early are not lost.
        sink.reset();
        Self {
            label,
            gate: Arc::new(Semaphore::new(default_concurrency())),
            sink,
            owns_sink,
            immediate: false,
            jobs: Vec::new(),
        }
    }

    /// Cap the number of jobs running at once. Call before submitting.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.gate = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Start each job as soon as it is submitted.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Add a job. In immediate mode this must be called inside a tokio runtime.
    pub fn submit<F>(&mut self, job: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let gate = Arc::clone(&self.gate);
        let sink = Arc::clone(&self.sink);
        let guarded = async move {
            let _permit = gate
                .acquire_owned()
                .await
                .map_err(|_| E::from(Error::Cancelled))?;
            let _advance = AdvanceOnDrop(sink);
            let result = job.await;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics::jobs_completed().add(1, &[KeyValue::new("result", outcome)]);
            result
        };

        let job = if self.immediate {
            Job::Spawned(tokio::spawn(guarded))
        } else {
            Job::Deferred(guarded.boxed())
        };
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn sink(&self) -> Arc<dyn ProgressSink> {
        Arc::clone(&self.sink)
    }

    /// Run every submitted job to completion.
    ///
    /// Returns the first failure observed, but only after all jobs have
    /// settled. A panicking job is re-raised once the others are done.
    pub async fn join(self) -> Result<(), E> {
        let TaskRunner {
            label,
            sink,
            owns_sink,
            jobs,
            ..
        } = self;

        let total = jobs.len() as u64;
        sink.set_total(total);
        sink.set_visible(total > 0);
        if total == 0 {
            debug!(label = %label, "no jobs to run");
            return Ok(());
        }

        debug!(label = %label, jobs = total, "joining jobs");

        let mut pending: FuturesUnordered<BoxFuture<'static, Settled<E>>> = jobs
            .into_iter()
            .map(|job| match job {
                Job::Deferred(fut) => AssertUnwindSafe(fut)
                    .catch_unwind()
                    .map(|res| match res {
                        Ok(result) => Settled::Done(result),
                        Err(panic) => Settled::Panicked(panic),
                    })
                    .boxed(),
                Job::Spawned(handle) => handle
                    .map(|res| match res {
                        Ok(result) => Settled::Done(result),
                        Err(e) if e.is_panic() => Settled::Panicked(e.into_panic()),
                        Err(_) => Settled::Done(Err(E::from(Error::Cancelled))),
                    })
                    .boxed(),
            })
            .collect();

        let mut first_failure = None;
        let mut failures = 0usize;
        let mut first_panic = None;
        while let Some(settled) = pending.next().await {
            match settled {
                Settled::Done(Ok(())) => {}
                Settled::Done(Err(e)) => {
                    failures += 1;
                    first_failure.get_or_insert(e);
                }
                Settled::Panicked(panic) => {
                    first_panic.get_or_insert(panic);
                }
            }
        }

        if owns_sink {
            sink.set_visible(false);
        }

        if let Some(panic) = first_panic {
            std::panic::resume_unwind(panic);
        }
        if failures > 1 {
            warn!(label = %label, failures, "several jobs failed, reporting the first");
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
