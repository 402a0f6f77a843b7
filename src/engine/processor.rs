//! What a worker actually does with an item.
//!
//! A [`Processor`] owns one expensive resource (a loaded model) and runs
//! items against it. Each worker thread builds its own processor through a
//! shared [`ProcessorFactory`], so processors never cross threads. The
//! processor may live in the thread itself or in a child process
//! ([`ChildProcessor`](crate::engine::child::ChildProcessor)).
//!
//! Failures are classified up front: transient errors are retried in place
//! by the [`RetryPolicy`]; fatal ones requeue the item and end the worker.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{ModelTag, WorkItem, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Known-recoverable; the same item may be retried on the same worker.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The item must go back to the queue and the worker must be replaced.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl ProcessError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-worker resource holder.
pub trait Processor {
    /// Swap in the resource for `model`. Only called when the tag changes.
    fn load(&mut self, model: &ModelTag) -> Result<(), ProcessError>;

    /// Run one item against the loaded resource. Must overwrite, not append
    /// to, the item's output: an item can be delivered more than once.
    fn process(&mut self, item: &WorkItem) -> Result<(), ProcessError>;

    /// Called while the worker is idle. An error ends the worker.
    fn check(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn load(&mut self, model: &ModelTag) -> Result<(), ProcessError> {
        (**self).load(model)
    }

    fn process(&mut self, item: &WorkItem) -> Result<(), ProcessError> {
        (**self).process(item)
    }

    fn check(&mut self) -> Result<(), ProcessError> {
        (**self).check()
    }
}

/// Builds a fresh [`Processor`] inside each worker thread.
pub trait ProcessorFactory: Send + Sync + 'static {
    fn create(&self, worker_id: WorkerId) -> Result<Box<dyn Processor>, ProcessError>;
}

impl<F, P> ProcessorFactory for F
where
    F: Fn(WorkerId) -> Result<P, ProcessError> + Send + Sync + 'static,
    P: Processor + 'static,
{
    fn create(&self, worker_id: WorkerId) -> Result<Box<dyn Processor>, ProcessError> {
        let processor = self(worker_id)?;
        Ok(Box::new(processor))
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded in-process retry of transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails fatally, or retries run out.
    ///
    /// `op` receives the zero-based attempt number. `on_retry` is told the
    /// number of the retry about to happen and the error that caused it.
    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, ProcessError>,
        mut on_retry: impl FnMut(u32, &ProcessError),
    ) -> Result<T, ProcessError> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    on_retry(attempt, &e);
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// External command processor
// ---------------------------------------------------------------------------

/// An external program run once per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Exit codes that mean "try again".
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            transient_exit_codes: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn transient_exit_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.transient_exit_codes = codes.into();
        self
    }
}

/// Runs items through an external program chosen by model tag.
///
/// The program receives the item through `BATCHQ_*` environment variables
/// and is expected to write `BATCHQ_OUTPUT`, whose parent directory already
/// exists. Its stdout goes to our stderr, since stdout may be the request
/// pipe of a worker process.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    worker_id: WorkerId,
    commands: Arc<HashMap<ModelTag, CommandSpec>>,
    loaded: Option<(ModelTag, CommandSpec)>,
}

impl CommandProcessor {
    pub fn new(worker_id: WorkerId, commands: Arc<HashMap<ModelTag, CommandSpec>>) -> Self {
        Self {
            worker_id,
            commands,
            loaded: None,
        }
    }
}

impl Processor for CommandProcessor {
    fn load(&mut self, model: &ModelTag) -> Result<(), ProcessError> {
        self.loaded = None;
        let cmd = self
            .commands
            .get(model)
            .ok_or_else(|| ProcessError::fatal(format!("no command configured for model {model}")))?;
        self.loaded = Some((model.clone(), cmd.clone()));
        Ok(())
    }

    fn process(&mut self, item: &WorkItem) -> Result<(), ProcessError> {
        let (model, cmd) = self
            .loaded
            .as_ref()
            .ok_or_else(|| ProcessError::fatal("process called before load"))?;

        let output = item.output_path();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProcessError::fatal(format!("create {}: {e}", parent.display()))
            })?;
        }

        debug!(
            worker_id = %self.worker_id,
            program = %cmd.program,
            file_key = item.file_key(),
            "running command"
        );

        let status = Command::new(&cmd.program)
            .args(&cmd.args)
            .env("BATCHQ_INPUT", item.input_path())
            .env("BATCHQ_OUTPUT", &output)
            .env("BATCHQ_FILE_KEY", item.file_key())
            .env("BATCHQ_MODEL", model.as_str())
            .env("BATCHQ_WORKER_ID", self.worker_id.to_string())
            .stdin(Stdio::null())
            .stdout(std::io::stderr())
            .status()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    ProcessError::fatal(format!("{} not found", cmd.program))
                }
                _ => ProcessError::transient(format!("spawn {}: {e}", cmd.program)),
            })?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) if cmd.transient_exit_codes.contains(&code) => Err(
                ProcessError::transient(format!("{} exited with status {code}", cmd.program)),
            ),
            Some(code) => Err(ProcessError::fatal(format!(
                "{} exited with status {code}",
                cmd.program
            ))),
            None => Err(ProcessError::fatal(format!(
                "{} terminated by signal",
                cmd.program
            ))),
        }
    }
}
