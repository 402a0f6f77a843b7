//! Worker thread: dequeue, load, process, acknowledge or requeue.
//!
//! A worker blocks on the queue with a short timeout so that it notices its
//! stop token promptly. On an unrecoverable item failure it puts the item
//! back *before* acknowledging the failed delivery and then exits; the
//! pool's watch loop notices the dead thread and starts a replacement.
//! While idle it also asks its processor whether it is still usable, which
//! is how a worker process that died between items is noticed.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::engine::counter::CompletionCounter;
use crate::engine::processor::{Processor, ProcessorFactory, RetryPolicy};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog};
use crate::model::{ModelTag, WorkItem, WorkerId, WorkerState};
use crate::queue::DurableQueue;
use crate::telemetry::{metrics, work};

/// State shared by every worker of one pool.
pub(crate) struct WorkerContext {
    pub queue: Arc<DurableQueue<WorkItem>>,
    pub counter: Arc<CompletionCounter>,
    pub events: Arc<EventLog>,
    pub factory: Arc<dyn ProcessorFactory>,
    pub retry: RetryPolicy,
    pub poll_timeout: Duration,
}

/// How a worker thread ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// Its stop token was cancelled.
    Stopped,
    /// An item failed for good (already requeued) or the processor could
    /// not be built.
    Failed(Error),
    /// The thread panicked outside item processing.
    Panicked(String),
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Stopped => write!(f, "stopped"),
            WorkerExit::Failed(e) => write!(f, "failed: {e}"),
            WorkerExit::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Owner's handle on one worker thread.
pub struct WorkerHandle {
    id: WorkerId,
    dying: Arc<AtomicBool>,
    thread: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub(crate) fn spawn(context: Arc<WorkerContext>, stop: CancellationToken) -> Result<Self> {
        let id = WorkerId::new();
        let dying = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            id,
            context,
            stop,
            dying: Arc::clone(&dying),
            state: WorkerState::Idle,
            loaded: None,
        };
        let thread = std::thread::Builder::new()
            .name(format!("batchq-worker-{id}"))
            .spawn(move || worker.run())?;
        Ok(Self { id, dying, thread })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// `true` once the thread has exited for any reason.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// `true` once the worker has given up and is on its way out. Set before
    /// its item is requeued.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    /// Wait for the thread and report how it ended.
    pub fn join(self) -> WorkerExit {
        match self.thread.join() {
            Ok(Ok(())) => WorkerExit::Stopped,
            Ok(Err(e)) => WorkerExit::Failed(e),
            Err(panic) => WorkerExit::Panicked(panic_message(&*panic)),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Worker {
    id: WorkerId,
    context: Arc<WorkerContext>,
    stop: CancellationToken,
    dying: Arc<AtomicBool>,
    state: WorkerState,
    loaded: Option<ModelTag>,
}

impl Worker {
    fn run(mut self) -> Result<()> {
        let span = work::start_worker_span(&self.id);
        let _enter = span.enter();

        let mut processor = self.context.factory.create(self.id).inspect_err(|_| {
            self.dying.store(true, Ordering::SeqCst);
        })?;
        debug!("worker ready");

        while !self.stop.is_cancelled() {
            let Some(item) = self.context.queue.get_timeout(self.context.poll_timeout) else {
                if let Err(e) = processor.check() {
                    self.dying.store(true, Ordering::SeqCst);
                    warn!(error = %e, "processor no longer usable");
                    return Err(e.into());
                }
                continue;
            };
            self.handle(processor.as_mut(), item)?;
        }

        debug!("worker stopped");
        Ok(())
    }

    /// Run one item to acknowledgment, or requeue it and return the failure.
    fn handle(&mut self, processor: &mut dyn Processor, item: WorkItem) -> Result<()> {
        let span = work::start_item_span(&self.id, &item);
        let _enter = span.enter();
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(processor, &item, &span)))
            .unwrap_or_else(|panic| Err(Error::WorkerPanicked(panic_message(&*panic))));

        match outcome {
            Ok(()) => {
                self.enter(&span, WorkerState::Acknowledging)?;
                self.context.counter.increment();
                self.context.queue.task_done()?;
                self.context.events.record(EventKind::ItemCompleted {
                    worker_id: self.id,
                    file_key: item.file_key().to_string(),
                });
                let model = KeyValue::new("model", item.model().to_string());
                metrics::items_completed().add(1, std::slice::from_ref(&model));
                metrics::item_duration_ms()
                    .record(started.elapsed().as_secs_f64() * 1000.0, &[model]);
                self.enter(&span, WorkerState::Idle)
            }
            Err(e) => {
                self.dying.store(true, Ordering::SeqCst);
                self.enter(&span, WorkerState::Failing)?;
                warn!(file_key = item.file_key(), error = %e, "item failed, requeueing");
                let file_key = item.file_key().to_string();
                self.context.queue.requeue(item)?;
                self.context.events.record(EventKind::ItemRequeued {
                    worker_id: self.id,
                    file_key,
                    error: e.to_string(),
                });
                metrics::items_requeued().add(1, &[]);
                Err(e)
            }
        }
    }

    fn execute(&mut self, processor: &mut dyn Processor, item: &WorkItem, span: &Span) -> Result<()> {
        if self.loaded.as_ref() != Some(item.model()) {
            self.enter(span, WorkerState::Loading)?;
            self.loaded = None;
            info!(model = %item.model(), "loading model");
            processor.load(item.model())?;
            self.loaded = Some(item.model().clone());
            self.context.events.record(EventKind::ModelLoaded {
                worker_id: self.id,
                model: item.model().clone(),
            });
        }

        self.enter(span, WorkerState::Processing)?;
        let retry = self.context.retry;
        let events = &self.context.events;
        let worker_id = self.id;
        retry.run(
            |_| processor.process(item),
            |attempt, e| {
                warn!(file_key = item.file_key(), attempt, error = %e, "transient failure, retrying");
                events.record(EventKind::ItemRetried {
                    worker_id,
                    file_key: item.file_key().to_string(),
                    attempt,
                    error: e.to_string(),
                });
                metrics::item_retries().add(1, &[]);
            },
        )?;
        Ok(())
    }

    fn enter(&mut self, span: &Span, to: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        work::record_state_transition(span, self.state, to);
        self.state = to;
        Ok(())
    }
}
