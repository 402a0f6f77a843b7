//! Driving a pipeline over a directory of files.
//!
//! Every stage reuses the same worker pool: select the stage's model, bind a
//! progress line, submit one item per file, watch until every item is
//! counted, then wait for the queue to drain before the next stage. When the
//! pipeline has a prepare step, its conversions run under the bounded task
//! runner and each finished conversion feeds the first stage directly, so
//! the runner and the pool's watch loop are awaited together.
//!
//! With `skip_existing`, a file is left out of the whole run when its final
//! output exists, and left out of any single step whose output for it
//! exists.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{Instrument as _, debug, info, info_span};

use crate::engine::WorkerPool;
use crate::engine::processor::ProcessError;
use crate::error::{Error, Result};
use crate::model::ModelTag;
use crate::pipeline::{Pipeline, PrepareStep, discover_files, split_command};
use crate::progress::{Console, ProgressSink};
use crate::runner::{TaskRunner, default_concurrency};

/// Where a run reads from and writes to.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input_dir: PathBuf,
    /// Each step writes into its own directory under here.
    pub work_dir: PathBuf,
    /// Prepare-step concurrency when the pipeline does not set one.
    pub concurrency: usize,
    /// Leave out files whose final output already exists, and in every step
    /// the files whose output for that step already exists.
    pub skip_existing: bool,
}

impl RunOptions {
    pub fn new(input_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            work_dir: work_dir.into(),
            concurrency: default_concurrency(),
            skip_existing: false,
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    /// `None` for the prepare step.
    pub model: Option<ModelTag>,
    /// Items this step actually ran.
    pub items: u64,
    /// Outputs found on disk and not recomputed.
    #[serde(default)]
    pub reused: u64,
    pub output_dir: PathBuf,
    pub elapsed_ms: u64,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Files processed.
    pub files: usize,
    /// Files left out because their final output already existed.
    pub skipped: usize,
    pub stages: Vec<StageSummary>,
}

/// Run every step of `pipeline` over the files under `options.input_dir`.
///
/// The pool must have been built from this pipeline's processor factory.
/// It is left running; the caller terminates it.
pub async fn run_pipeline(
    pipeline: &Pipeline,
    pool: &Arc<WorkerPool>,
    console: &Console,
    options: &RunOptions,
) -> Result<RunSummary> {
    for dir in [&options.input_dir, &options.work_dir] {
        if dir.to_str().is_none() {
            return Err(Error::Config(format!(
                "directory name is not valid UTF-8: {}",
                dir.display()
            )));
        }
    }

    let discovered = discover_files(&options.input_dir)?;
    let found = discovered.len();

    let files: Vec<String> = match (options.skip_existing, pipeline.final_dir()) {
        (true, Some(final_dir)) => {
            let final_dir = options.work_dir.join(final_dir);
            discovered
                .into_iter()
                .filter(|key| !final_dir.join(key).exists())
                .collect()
        }
        _ => discovered,
    };
    let skipped = found - files.len();
    if skipped > 0 {
        info!(skipped, "skipping files with existing output");
    }
    info!(
        files = files.len(),
        stages = pipeline.stages.len(),
        "starting pipeline"
    );

    let mut stages = Vec::with_capacity(pipeline.stages.len() + 1);
    let mut input_dir = match &pipeline.prepare {
        Some(prepare) => options.work_dir.join(&prepare.dir),
        None => options.input_dir.clone(),
    };

    for (index, stage) in pipeline.stages.iter().enumerate() {
        let started = Instant::now();
        let output_dir = options.work_dir.join(stage.dir_name(index));
        let span = info_span!("stage", name = %stage.name, model = %stage.model);

        let (pending, reused) = outstanding(&files, &output_dir, options.skip_existing);
        if reused > 0 {
            span.in_scope(|| info!(reused, "stage outputs already present"));
        }

        pool.set_wanted_model(stage.model.clone());
        let line = console.line(stage.name.clone(), "files");
        pool.configure_progress(
            Arc::new(line.clone()),
            pending.len() as u64,
            !pending.is_empty(),
        );

        match (&pipeline.prepare, index) {
            (Some(prepare), 0) => {
                let summary =
                    prepare_into_pool(prepare, pool, console, options, &pending, &output_dir)
                        .instrument(span.clone())
                        .await?;
                stages.push(summary);
            }
            _ => {
                for key in &pending {
                    pool.submit(&input_dir, &output_dir, key.as_str())?;
                }
                pool.watch().instrument(span.clone()).await?;
            }
        }
        line.set_visible(false);
        pool.wait_async().await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.in_scope(|| info!(items = pending.len(), elapsed_ms, "stage finished"));
        stages.push(StageSummary {
            name: stage.name.clone(),
            model: Some(stage.model.clone()),
            items: pending.len() as u64,
            reused,
            output_dir: output_dir.clone(),
            elapsed_ms,
        });
        input_dir = output_dir;
    }

    Ok(RunSummary {
        files: files.len(),
        skipped,
        stages,
    })
}

/// Keys whose output in `output_dir` is still missing, and how many were
/// left out because it exists.
fn outstanding(files: &[String], output_dir: &Path, skip_existing: bool) -> (Vec<String>, u64) {
    if !skip_existing {
        return (files.to_vec(), 0);
    }
    let pending: Vec<String> = files
        .iter()
        .filter(|key| !output_dir.join(key).exists())
        .cloned()
        .collect();
    let reused = (files.len() - pending.len()) as u64;
    (pending, reused)
}

/// Convert every file under the task runner, submitting each one to the
/// pool as soon as it is ready, while the pool's watch loop runs.
async fn prepare_into_pool(
    prepare: &PrepareStep,
    pool: &Arc<WorkerPool>,
    console: &Console,
    options: &RunOptions,
    files: &[String],
    stage_output: &Path,
) -> Result<StageSummary> {
    let started = Instant::now();
    let prepared_dir = options.work_dir.join(&prepare.dir);
    let (program, args) = split_command(&prepare.command, &prepare.name)?;

    let line: Arc<dyn ProgressSink> = Arc::new(console.line(prepare.name.clone(), "files"));
    let mut runner = TaskRunner::<Error>::with_sink(prepare.name.clone(), Arc::clone(&line))
        .concurrency(prepare.concurrency.unwrap_or(options.concurrency));
    let reused = Arc::new(AtomicU64::new(0));

    for key in files {
        let job = PrepareJob {
            program: program.to_string(),
            args: args.to_vec(),
            input: options.input_dir.join(key),
            output: prepared_dir.join(key),
            key: key.clone(),
        };
        let skip_existing = options.skip_existing;
        let pool = Arc::clone(pool);
        let prepared_dir = prepared_dir.clone();
        let stage_output = stage_output.to_path_buf();
        let reused = Arc::clone(&reused);

        runner.submit(async move {
            if skip_existing && job.output.exists() {
                debug!(file_key = %job.key, "reusing prepared file");
                reused.fetch_add(1, Ordering::Relaxed);
            } else {
                job.run().await?;
            }
            pool.submit(prepared_dir, stage_output, job.key)
        });
    }

    let converted = async {
        let result = runner.join().await;
        line.set_visible(false);
        result.map(|()| started.elapsed())
    };
    let (elapsed, ()) = tokio::try_join!(converted, pool.watch())?;

    let reused = reused.load(Ordering::Relaxed);
    if reused > 0 {
        info!(reused, "prepare outputs reused");
    }

    Ok(StageSummary {
        name: prepare.name.clone(),
        model: None,
        items: files.len() as u64,
        reused,
        output_dir: prepared_dir,
        elapsed_ms: elapsed.as_millis() as u64,
    })
}

struct PrepareJob {
    program: String,
    args: Vec<String>,
    input: PathBuf,
    output: PathBuf,
    key: String,
}

impl PrepareJob {
    async fn run(&self) -> Result<()> {
        if let Some(parent) = self.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(program = %self.program, file_key = %self.key, "running prepare command");

        let status = Command::new(&self.program)
            .args(&self.args)
            .env("BATCHQ_INPUT", &self.input)
            .env("BATCHQ_OUTPUT", &self.output)
            .env("BATCHQ_FILE_KEY", &self.key)
            .stdin(Stdio::null())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::fatal(format!(
                "{} exited with status {} for {}",
                self.program,
                status.code().unwrap_or(-1),
                self.key
            ))
            .into())
        }
    }
}
