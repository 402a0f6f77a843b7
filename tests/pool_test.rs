//! Integration tests for the worker pool: supervision, requeue-before-ack,
//! model reloading and multi-stage reuse.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use batchq::Error;
use batchq::engine::{PoolConfig, ProcessError, Processor, ProcessorFactory, WorkerPool};
use batchq::event::EventKind;
use batchq::model::{ModelTag, WorkItem, WorkerId};
use batchq::progress::ProgressLine;

// ---------------------------------------------------------------------------
// Scripted processor
// ---------------------------------------------------------------------------

/// Shared script for every fake processor in a pool. Keys listed in the
/// `*_once` sets misbehave the first time they are processed.
#[derive(Default)]
struct Script {
    fatal_once: Mutex<HashSet<String>>,
    transient_once: Mutex<HashSet<String>>,
    panic_once: Mutex<HashSet<String>>,
    loads: Mutex<Vec<(WorkerId, ModelTag)>>,
    done: Mutex<Vec<(String, ModelTag)>>,
}

impl Script {
    fn fail_once(set: &Mutex<HashSet<String>>, keys: &[&str]) {
        set.lock()
            .unwrap()
            .extend(keys.iter().map(|k| k.to_string()));
    }

    fn done_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.done.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }
}

struct Fake {
    id: WorkerId,
    script: Arc<Script>,
    model: Option<ModelTag>,
}

impl Processor for Fake {
    fn load(&mut self, model: &ModelTag) -> Result<(), ProcessError> {
        self.script.loads.lock().unwrap().push((self.id, model.clone()));
        self.model = Some(model.clone());
        Ok(())
    }

    fn process(&mut self, item: &WorkItem) -> Result<(), ProcessError> {
        let key = item.file_key().to_string();
        if self.script.fatal_once.lock().unwrap().remove(&key) {
            return Err(ProcessError::fatal(format!("decoder crashed on {key}")));
        }
        if self.script.transient_once.lock().unwrap().remove(&key) {
            return Err(ProcessError::transient("device busy"));
        }
        if self.script.panic_once.lock().unwrap().remove(&key) {
            panic!("out of memory on {key}");
        }
        assert_eq!(self.model.as_ref(), Some(item.model()));
        std::thread::sleep(Duration::from_millis(2));
        self.script.done.lock().unwrap().push((key, item.model().clone()));
        Ok(())
    }
}

fn factory(script: &Arc<Script>) -> impl ProcessorFactory + use<> {
    let script = Arc::clone(script);
    move |id: WorkerId| -> Result<Fake, ProcessError> {
        Ok(Fake {
            id,
            script: Arc::clone(&script),
            model: None,
        })
    }
}

fn config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        watch_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_millis(10),
        ..PoolConfig::default()
    }
}

const WATCH_LIMIT: Duration = Duration::from_secs(10);

async fn watch(pool: &WorkerPool) {
    tokio::time::timeout(WATCH_LIMIT, pool.watch())
        .await
        .expect("watch timed out")
        .expect("watch failed");
}

/// Reap until `expected` respawns have happened. A worker whose processor
/// could not be built holds no item, so watch can finish before it is seen.
fn reap_until(pool: &WorkerPool, expected: u64) {
    let deadline = Instant::now() + WATCH_LIMIT;
    while pool.respawns() < expected {
        assert!(Instant::now() < deadline, "respawn never happened");
        pool.reap();
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn submit_all(pool: &WorkerPool, keys: &[&str]) {
    for key in keys {
        pool.submit("in", "out", *key).unwrap();
    }
}

fn shutdown(pool: &WorkerPool) {
    pool.terminate();
    pool.join();
}

const FIVE: [&str; 5] = ["01.flac", "02.flac", "03.flac", "04.flac", "05.flac"];

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crashed_item_is_redelivered_and_worker_replaced() {
    let script = Arc::new(Script::default());
    Script::fail_once(&script.fatal_once, &["03.flac"]);
    let pool = WorkerPool::new(factory(&script), config(2)).unwrap();
    let line = ProgressLine::new("Separating audio");

    pool.set_wanted_model("A");
    pool.configure_progress(Arc::new(line.clone()), 5, true);
    submit_all(&pool, &FIVE);

    watch(&pool).await;
    // The crashed worker is already replaced when watch returns.
    assert_eq!(pool.respawns(), 1);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.live_workers(), 2);

    assert!(pool.wait_timeout(WATCH_LIMIT));
    assert_eq!(script.done_keys(), FIVE);
    assert_eq!(line.snapshot().completed, 5);

    let stats = pool.queue_stats();
    assert_eq!(stats.enqueued, 6);
    assert_eq!(stats.acknowledged, 6);
    assert_eq!(stats.unfinished, 0);

    let events = pool.events();
    assert_eq!(
        events.count(|e| matches!(e, EventKind::ItemRequeued { file_key, .. } if file_key == "03.flac")),
        1
    );
    assert_eq!(events.count(|e| matches!(e, EventKind::WorkerDied { .. })), 1);
    assert_eq!(events.count(|e| matches!(e, EventKind::WorkerRespawned { .. })), 1);
    assert_eq!(events.count(|e| matches!(e, EventKind::ItemCompleted { .. })), 5);

    shutdown(&pool);
}

#[tokio::test]
async fn panicking_processor_is_treated_as_a_crash() {
    let script = Arc::new(Script::default());
    Script::fail_once(&script.panic_once, &["02.flac"]);
    let pool = WorkerPool::new(factory(&script), config(1)).unwrap();
    let line = ProgressLine::new("Separating audio");

    pool.set_wanted_model("A");
    pool.configure_progress(Arc::new(line.clone()), 5, true);
    submit_all(&pool, &FIVE);

    watch(&pool).await;
    assert_eq!(pool.respawns(), 1);
    assert_eq!(pool.live_workers(), 1);
    pool.wait();

    assert_eq!(script.done_keys(), FIVE);
    assert_eq!(line.snapshot().completed, 5);
    assert_eq!(pool.queue_stats().unfinished, 0);
    shutdown(&pool);
}

#[tokio::test]
async fn transient_failure_retries_without_respawn() {
    let script = Arc::new(Script::default());
    Script::fail_once(&script.transient_once, &["b", "c"]);
    let pool = WorkerPool::new(factory(&script), config(2)).unwrap();
    let line = ProgressLine::new("Removing reverb");

    pool.set_wanted_model("A");
    pool.configure_progress(Arc::new(line.clone()), 3, true);
    submit_all(&pool, &["a", "b", "c"]);

    watch(&pool).await;
    pool.wait();

    assert_eq!(script.done_keys(), ["a", "b", "c"]);
    assert_eq!(pool.respawns(), 0);
    assert_eq!(pool.queue_stats().enqueued, 3);
    assert_eq!(
        pool.events()
            .count(|e| matches!(e, EventKind::ItemRetried { attempt: 1, .. })),
        2
    );
    shutdown(&pool);
}

#[tokio::test]
async fn processor_that_cannot_be_built_is_replaced() {
    let script = Arc::new(Script::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let inner = factory(&script);
    let counted = Arc::clone(&attempts);
    let flaky = move |id: WorkerId| -> Result<Box<dyn Processor>, ProcessError> {
        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ProcessError::fatal("GPU not ready"));
        }
        inner.create(id)
    };
    let pool = WorkerPool::new(flaky, config(2)).unwrap();
    let line = ProgressLine::new("Separating audio");

    pool.set_wanted_model("A");
    pool.configure_progress(Arc::new(line.clone()), 5, true);
    submit_all(&pool, &FIVE);

    watch(&pool).await;
    pool.wait();
    reap_until(&pool, 1);

    assert_eq!(script.done_keys(), FIVE);
    assert!(attempts.load(Ordering::SeqCst) >= 3);
    shutdown(&pool);
}

// ---------------------------------------------------------------------------
// Models and stages
// ---------------------------------------------------------------------------

#[test]
fn submit_without_model_is_rejected() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(1)).unwrap();

    let err = pool.submit("in", "out", "01.flac").unwrap_err();
    assert!(matches!(err, Error::NoModelSelected));
    assert_eq!(pool.queue_stats().enqueued, 0);
    shutdown(&pool);
}

#[test]
fn zero_workers_is_a_config_error() {
    let script = Arc::new(Script::default());
    let result = WorkerPool::new(factory(&script), config(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn watch_requires_a_progress_sink() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(1)).unwrap();
    assert!(matches!(pool.watch().await, Err(Error::ProgressNotConfigured)));
    shutdown(&pool);
}

#[tokio::test]
async fn zero_total_returns_immediately() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(1)).unwrap();
    let line = ProgressLine::new("empty");

    pool.set_wanted_model("A");
    pool.configure_progress(Arc::new(line.clone()), 0, false);

    tokio::time::timeout(Duration::from_millis(500), pool.watch())
        .await
        .expect("watch should not wait")
        .unwrap();
    assert!(pool.wait_timeout(Duration::from_millis(100)));
    assert!(!line.snapshot().visible);
    shutdown(&pool);
}

#[tokio::test]
async fn queued_items_keep_the_model_they_were_submitted_with() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(1)).unwrap();
    let line = ProgressLine::new("mixed");
    pool.configure_progress(Arc::new(line.clone()), 4, true);

    pool.set_wanted_model("A");
    submit_all(&pool, &["a1", "a2"]);
    pool.set_wanted_model("B");
    submit_all(&pool, &["b1", "b2"]);
    assert_eq!(pool.wanted_model(), Some(ModelTag::from("B")));

    watch(&pool).await;
    pool.wait();

    let done = script.done.lock().unwrap().clone();
    for (key, model) in &done {
        assert_eq!(model.as_str(), key[..1].to_uppercase());
    }
    // One worker, FIFO order: exactly one load per tag change.
    let loads: Vec<_> = script
        .loads
        .lock()
        .unwrap()
        .iter()
        .map(|(_, m)| m.as_str().to_string())
        .collect();
    assert_eq!(loads, ["A", "B"]);
    shutdown(&pool);
}

#[tokio::test]
async fn pool_is_reused_across_stages() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(2)).unwrap();

    let first = ProgressLine::new("Separating audio");
    pool.set_wanted_model("first.onnx");
    pool.configure_progress(Arc::new(first.clone()), 5, true);
    submit_all(&pool, &FIVE);
    watch(&pool).await;
    pool.wait();

    let second = ProgressLine::new("Removing reverb");
    pool.set_wanted_model("second.ckpt");
    pool.configure_progress(Arc::new(second.clone()), 5, true);
    submit_all(&pool, &FIVE);
    watch(&pool).await;
    pool.wait();

    assert_eq!(first.snapshot().completed, 5);
    assert_eq!(second.snapshot().completed, 5);

    let done = script.done.lock().unwrap().clone();
    assert_eq!(done.len(), 10);
    assert_eq!(
        done.iter().filter(|(_, m)| m.as_str() == "second.ckpt").count(),
        5
    );
    // Each worker that saw both stages loaded each model exactly once.
    let loads = script.loads.lock().unwrap().clone();
    for (worker, _) in &loads {
        assert!(loads.iter().filter(|(w, _)| w == worker).count() <= 2);
    }
    assert_eq!(pool.respawns(), 0);
    shutdown(&pool);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminate_stops_workers_and_rejects_submissions() {
    let script = Arc::new(Script::default());
    let pool = WorkerPool::new(factory(&script), config(3)).unwrap();
    pool.set_wanted_model("A");

    pool.terminate();
    pool.join();

    assert_eq!(pool.live_workers(), 0);
    assert_eq!(pool.reap(), 0);
    assert!(matches!(
        pool.submit("in", "out", "late.flac"),
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test]
async fn watch_stops_when_the_pool_is_terminated() {
    let script = Arc::new(Script::default());
    let pool = Arc::new(WorkerPool::new(factory(&script), config(1)).unwrap());
    let line = ProgressLine::new("never finishes");

    pool.set_wanted_model("A");
    // Nothing is submitted, so the total is never reached.
    pool.configure_progress(Arc::new(line), 3, true);

    let terminator = Arc::clone(&pool);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        terminator.terminate();
    });

    let result = tokio::time::timeout(WATCH_LIMIT, pool.watch())
        .await
        .expect("watch did not notice termination");
    assert!(matches!(result, Err(Error::ShuttingDown)));
    pool.join();
}
