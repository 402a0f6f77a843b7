//! Worker pool: fixed set of workers around one durable queue.
//!
//! The pool is reused across pipeline stages. Each stage selects a model
//! with [`WorkerPool::set_wanted_model`], binds a progress sink with
//! [`WorkerPool::configure_progress`], submits items, then runs
//! [`WorkerPool::watch`] (progress + supervision) and [`WorkerPool::wait`]
//! (the barrier).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::counter::CompletionCounter;
use crate::engine::processor::{ProcessorFactory, RetryPolicy};
use crate::engine::worker::{WorkerContext, WorkerExit, WorkerHandle};
use crate::error::{Error, Result};
use crate::event::{DEFAULT_RETAINED_EVENTS, EventKind, EventLog};
use crate::model::{ModelTag, WorkItem};
use crate::progress::ProgressSink;
use crate::queue::{DurableQueue, QueueStats};
use crate::telemetry::metrics;

/// Poll interval while a failed worker finishes exiting.
const SETTLE_POLL: Duration = Duration::from_millis(2);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers kept alive.
    pub workers: usize,
    /// Sleep between watch-loop polls.
    pub watch_interval: Duration,
    /// How long a worker blocks on the queue before re-checking its stop token.
    pub poll_timeout: Duration,
    /// In-process retries of a transient item failure.
    pub max_retries: u32,
    /// Events kept in the pool's event log.
    pub retained_events: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            watch_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(100),
            max_retries: RetryPolicy::default().max_retries,
            retained_events: DEFAULT_RETAINED_EVENTS,
        }
    }
}

/// A fixed-size, self-healing pool of workers. Each worker is a thread
/// driving a [`Processor`](crate::engine::Processor), which may in turn own
/// a worker process.
pub struct WorkerPool {
    config: PoolConfig,
    context: Arc<WorkerContext>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown: CancellationToken,
    wanted_model: Mutex<Option<ModelTag>>,
    progress: Mutex<Option<Arc<dyn ProgressSink>>>,
    respawns: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Start `config.workers` workers, each blocked on the shared queue.
    pub fn new(factory: impl ProcessorFactory, config: PoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".to_string()));
        }

        let context = Arc::new(WorkerContext {
            queue: Arc::new(DurableQueue::new()),
            counter: Arc::new(CompletionCounter::new()),
            events: Arc::new(EventLog::new(config.retained_events)),
            factory: Arc::new(factory),
            retry: RetryPolicy {
                max_retries: config.max_retries,
            },
            poll_timeout: config.poll_timeout,
        });

        let pool = Self {
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            config,
            context,
            shutdown: CancellationToken::new(),
            wanted_model: Mutex::new(None),
            progress: Mutex::new(None),
            respawns: AtomicU64::new(0),
        };

        {
            let mut workers = lock(&pool.workers);
            for _ in 0..pool.config.workers {
                workers.push(pool.start_worker()?);
            }
        }

        info!(workers = pool.config.workers, "worker pool started");
        Ok(pool)
    }

    fn start_worker(&self) -> Result<WorkerHandle> {
        let handle = WorkerHandle::spawn(Arc::clone(&self.context), self.shutdown.child_token())?;
        self.context.events.record(EventKind::WorkerStarted {
            worker_id: handle.id(),
        });
        metrics::workers_spawned().add(1, &[]);
        debug!(worker_id = %handle.id(), "worker started");
        Ok(handle)
    }

    /// Model applied to items submitted from now on. Items already queued
    /// keep the model they were submitted with.
    pub fn set_wanted_model(&self, model: impl Into<ModelTag>) {
        let model = model.into();
        info!(model = %model, "wanted model set");
        *lock(&self.wanted_model) = Some(model);
    }

    pub fn wanted_model(&self) -> Option<ModelTag> {
        lock(&self.wanted_model).clone()
    }

    /// Queue one file for the wanted model.
    ///
    /// # Errors
    ///
    /// [`Error::NoModelSelected`] if no model has been set yet,
    /// [`Error::ShuttingDown`] after [`terminate`](Self::terminate).
    pub fn submit(
        &self,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        file_key: impl Into<String>,
    ) -> Result<()> {
        let model = self.wanted_model().ok_or(Error::NoModelSelected)?;
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.context
            .queue
            .put(WorkItem::new(input_dir, output_dir, file_key, model));
        Ok(())
    }

    /// Bind `sink` for the next watch cycle and start counting from zero.
    pub fn configure_progress(&self, sink: Arc<dyn ProgressSink>, total: u64, visible: bool) {
        let stale = self.context.counter.drain();
        if stale > 0 {
            debug!(stale, "discarding completions from the previous stage");
        }
        sink.reset();
        sink.set_total(total);
        sink.set_visible(visible);
        *lock(&self.progress) = Some(sink);
        self.context
            .events
            .record(EventKind::StageConfigured { total, visible });
    }

    /// Forward completions to the bound sink and keep the pool at full
    /// strength until the sink's total is reached. On return every worker
    /// that failed during the watch has been replaced.
    ///
    /// # Errors
    ///
    /// [`Error::ProgressNotConfigured`] if no sink is bound,
    /// [`Error::ShuttingDown`] if the pool is terminated mid-watch.
    pub async fn watch(&self) -> Result<()> {
        let sink = lock(&self.progress)
            .clone()
            .ok_or(Error::ProgressNotConfigured)?;
        if sink.total() == Some(0) {
            return Ok(());
        }

        loop {
            let drained = self.context.counter.drain();
            if drained > 0 {
                sink.advance(drained);
            }

            self.reap();

            if sink.is_finished() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep(self.config.watch_interval) => {}
            }
        }

        // The last completion can be the redelivery of an item whose worker
        // is still exiting.
        while self.has_exiting_workers() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep(SETTLE_POLL) => {}
            }
        }
        self.reap();

        debug!(completed = sink.completed(), "watch finished");
        Ok(())
    }

    fn has_exiting_workers(&self) -> bool {
        lock(&self.workers)
            .iter()
            .any(|w| w.is_dying() && !w.is_finished())
    }

    /// One supervision pass: replace every dead worker. Returns how many
    /// replacements were started. Does nothing once terminated.
    pub fn reap(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let mut workers = lock(&self.workers);
        let (dead, alive): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *workers).into_iter().partition(WorkerHandle::is_finished);
        *workers = alive;

        let mut dead_ids = Vec::with_capacity(dead.len());
        for handle in dead {
            let worker_id = handle.id();
            let exit = handle.join();
            warn!(worker_id = %worker_id, exit = %exit, "worker died, respawning");
            self.context.events.record(EventKind::WorkerDied {
                worker_id,
                reason: exit.to_string(),
            });
            dead_ids.push(worker_id);
        }

        let mut started = 0;
        while workers.len() < self.config.workers {
            match self.start_worker() {
                Ok(replacement) => {
                    if let Some(dead) = dead_ids.pop() {
                        self.context.events.record(EventKind::WorkerRespawned {
                            dead,
                            replacement: replacement.id(),
                        });
                    }
                    self.respawns.fetch_add(1, Ordering::Relaxed);
                    metrics::worker_respawns().add(1, &[]);
                    workers.push(replacement);
                    started += 1;
                }
                Err(e) => {
                    // Next pass tries again.
                    error!(error = %e, "failed to start replacement worker");
                    break;
                }
            }
        }
        started
    }

    /// Block until every submitted item has been acknowledged.
    pub fn wait(&self) {
        self.context.queue.join();
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.context.queue.join_timeout(timeout)
    }

    /// [`wait`](Self::wait) for async callers. Gives up with
    /// [`Error::ShuttingDown`] once the pool is terminated.
    pub async fn wait_async(&self) -> Result<()> {
        loop {
            let queue = Arc::clone(&self.context.queue);
            let slice = self.config.watch_interval;
            let drained = tokio::task::spawn_blocking(move || queue.join_timeout(slice))
                .await
                .map_err(|e| Error::Other(format!("queue join task failed: {e}")))?;
            if drained {
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
        }
    }

    /// Configured pool size.
    pub fn size(&self) -> usize {
        self.config.workers
    }

    /// Workers whose thread is still running.
    pub fn live_workers(&self) -> usize {
        lock(&self.workers)
            .iter()
            .filter(|w| !w.is_finished())
            .count()
    }

    /// Dead workers replaced so far.
    pub fn respawns(&self) -> u64 {
        self.respawns.load(Ordering::Relaxed)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.context.queue.stats()
    }

    pub fn events(&self) -> &EventLog {
        &self.context.events
    }

    /// Tell every worker to leave its loop. Items still queued stay queued.
    pub fn terminate(&self) {
        if !self.shutdown.is_cancelled() {
            info!("terminating workers");
            self.shutdown.cancel();
        }
    }

    /// Wait for every worker thread to exit. Call after
    /// [`terminate`](Self::terminate), otherwise this blocks forever.
    pub fn join(&self) {
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            let worker_id = handle.id();
            match handle.join() {
                WorkerExit::Stopped => debug!(worker_id = %worker_id, "worker joined"),
                exit => warn!(worker_id = %worker_id, exit = %exit, "worker exited abnormally"),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
