//! Pipeline definitions.
//!
//! A pipeline is an optional prepare step followed by one or more stages.
//! The prepare step runs a command per input file under the bounded
//! [`TaskRunner`](crate::runner::TaskRunner); every stage runs a command per
//! file on the shared worker pool, with the stage's model loaded. The
//! stage's model is loaded either in the worker thread itself
//! ([`Pipeline::processor_factory`]) or in a worker process per worker
//! ([`Pipeline::isolated_factory`]).

pub mod run;

pub use run::{RunOptions, RunSummary, StageSummary, run_pipeline};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use uuid::Uuid;

use crate::engine::child::{ChildCommand, child_factory};
use crate::engine::processor::{CommandProcessor, CommandSpec, ProcessError, ProcessorFactory};
use crate::error::{Error, Result};
use crate::model::{ModelTag, WorkerId};

/// Stage commands handed to a worker process, as JSON.
pub const COMMANDS_ENV: &str = "BATCHQ_COMMANDS";

/// Top-level TOML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub prepare: Option<PrepareStep>,
    #[serde(rename = "stage", default)]
    pub stages: Vec<Stage>,
}

/// Per-file conversion run before the first stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareStep {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Conversions running at once. Falls back to the run's concurrency.
    pub concurrency: Option<usize>,
    /// Output directory under the work dir.
    #[serde(default = "default_prepare_dir")]
    pub dir: String,
}

fn default_prepare_dir() -> String {
    "prepared".to_string()
}

/// One pass of every file through the worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub name: String,
    pub model: ModelTag,
    pub command: Vec<String>,
    pub dir: Option<String>,
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
}

impl Stage {
    /// Output directory name; `index` is zero-based.
    pub fn dir_name(&self, index: usize) -> String {
        self.dir
            .clone()
            .unwrap_or_else(|| format!("stage-{}", index + 1))
    }

    fn command_spec(&self) -> Result<CommandSpec> {
        let (program, args) = split_command(&self.command, &self.name)?;
        Ok(CommandSpec::new(program)
            .args(args.iter().cloned())
            .transient_exit_codes(self.transient_exit_codes.clone()))
    }
}

pub(crate) fn split_command<'a>(command: &'a [String], owner: &str) -> Result<(&'a str, &'a [String])> {
    match command.split_first() {
        Some((program, args)) if !program.trim().is_empty() => Ok((program.as_str(), args)),
        _ => Err(Error::Config(format!("{owner}: command must not be empty"))),
    }
}

impl Pipeline {
    /// Parse and validate a pipeline from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let pipeline: Pipeline = toml::from_str(content)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Read, parse and validate a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline {}: {e}", path.display()))
        })?;
        let pipeline: Pipeline = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad pipeline {}: {e}", path.display())))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config("pipeline has no [[stage]]".to_string()));
        }

        let mut dirs = HashSet::new();
        if let Some(prepare) = &self.prepare {
            split_command(&prepare.command, &prepare.name)?;
            if prepare.concurrency == Some(0) {
                return Err(Error::Config(format!(
                    "{}: concurrency must be at least 1",
                    prepare.name
                )));
            }
            dirs.insert(prepare.dir.clone());
        }

        let mut models = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            split_command(&stage.command, &stage.name)?;
            if stage.model.as_str().is_empty() {
                return Err(Error::Config(format!("{}: model must not be empty", stage.name)));
            }
            // Commands are looked up by model, so a model names one command.
            if !models.insert(stage.model.clone()) {
                return Err(Error::Config(format!(
                    "model {} is used by more than one stage",
                    stage.model
                )));
            }
            let dir = stage.dir_name(index);
            if !dirs.insert(dir.clone()) {
                return Err(Error::Config(format!("output dir {dir} is used twice")));
            }
        }
        Ok(())
    }

    /// Command to run for each stage's model.
    pub fn commands(&self) -> Result<HashMap<ModelTag, CommandSpec>> {
        self.stages
            .iter()
            .map(|stage| Ok((stage.model.clone(), stage.command_spec()?)))
            .collect()
    }

    /// Factory building a [`CommandProcessor`] per worker.
    pub fn processor_factory(&self) -> Result<impl ProcessorFactory + use<>> {
        let commands = Arc::new(self.commands()?);
        Ok(
            move |worker_id: WorkerId| -> std::result::Result<CommandProcessor, ProcessError> {
                Ok(CommandProcessor::new(worker_id, Arc::clone(&commands)))
            },
        )
    }

    /// Factory starting one worker process per worker from `worker`. The
    /// process receives the stage commands in [`COMMANDS_ENV`] and must
    /// answer requests with [`serve`](crate::engine::serve) over
    /// [`worker_processor_from_env`], as `batchq worker` does.
    pub fn isolated_factory(&self, worker: ChildCommand) -> Result<impl ProcessorFactory + use<>> {
        let commands = serde_json::to_string(&self.commands()?)?;
        Ok(child_factory(worker.env(COMMANDS_ENV, commands)))
    }

    /// Output directory of the last stage, relative to the work dir.
    pub fn final_dir(&self) -> Option<String> {
        let index = self.stages.len().checked_sub(1)?;
        Some(self.stages[index].dir_name(index))
    }
}

/// The processor a worker process runs: a [`CommandProcessor`] over the
/// commands in [`COMMANDS_ENV`], for the worker named by `BATCHQ_WORKER_ID`.
pub fn worker_processor_from_env() -> Result<CommandProcessor> {
    let raw = std::env::var(COMMANDS_ENV)
        .map_err(|_| Error::Config(format!("{COMMANDS_ENV} is not set")))?;
    let commands: HashMap<ModelTag, CommandSpec> = serde_json::from_str(&raw)?;
    let worker_id = std::env::var("BATCHQ_WORKER_ID")
        .ok()
        .and_then(|id| id.parse::<Uuid>().ok())
        .map(WorkerId)
        .unwrap_or_default();
    Ok(CommandProcessor::new(worker_id, Arc::new(commands)))
}

/// Every regular file under `dir`, as `/`-separated keys relative to `dir`,
/// sorted.
///
/// # Errors
///
/// [`Error::Config`] if a name under `dir` is not valid UTF-8: keys travel
/// as text to external commands and worker processes.
pub fn discover_files(dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| {
            Error::Config(format!("cannot read input dir {}: {e}", current.display()))
        })?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(dir)
                    .map_err(|e| Error::Other(format!("{}: {e}", path.display())))?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_str())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "file name is not valid UTF-8: {}",
                            path.display()
                        ))
                    })?;
                keys.push(key.join("/"));
            }
        }
    }

    keys.sort();
    Ok(keys)
}
