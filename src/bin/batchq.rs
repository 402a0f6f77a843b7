//! batchq CLI: run file-processing pipelines on a crash-tolerant worker pool.

use batchq::config::{Config, Isolation};
use batchq::engine::{ChildCommand, WorkerPool, serve};
use batchq::pipeline::{Pipeline, RunOptions, RunSummary, run_pipeline, worker_processor_from_env};
use batchq::progress::Console;
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batchq", about = "Crash-tolerant batch file processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline over every file in a directory
    Run {
        /// Pipeline definition (TOML)
        #[arg(long)]
        pipeline: PathBuf,
        /// Directory of input files
        #[arg(long)]
        input: PathBuf,
        /// Directory receiving one sub-directory per step
        #[arg(long)]
        work_dir: PathBuf,
        /// Workers (overrides BATCHQ_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Run each worker's model in a worker process or in the worker
        /// thread (overrides BATCHQ_ISOLATION)
        #[arg(long)]
        isolation: Option<Isolation>,
        /// Prepare-step concurrency (overrides BATCHQ_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Skip files whose final output already exists
        #[arg(long)]
        skip_existing: bool,
        /// Print the run summary as JSON and draw no progress bars
        #[arg(long)]
        json: bool,
    },
    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline definition (TOML)
        #[arg(long)]
        pipeline: PathBuf,
    },
    /// Serve one worker's requests on stdin/stdout (started by `run`)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            pipeline,
            input,
            work_dir,
            workers,
            isolation,
            concurrency,
            skip_existing,
            json,
        } => {
            let mut config = Config::from_env()?;
            if let Some(workers) = workers {
                anyhow::ensure!(workers > 0, "--workers must be at least 1");
                config.workers = workers;
            }
            if let Some(isolation) = isolation {
                config.isolation = isolation;
            }
            if let Some(concurrency) = concurrency {
                anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
                config.concurrency = concurrency;
            }

            let mut options = RunOptions::new(input, work_dir);
            options.concurrency = config.concurrency;
            options.skip_existing = skip_existing;

            cmd_run(config, pipeline, options, json).await
        }
        Command::Validate { pipeline } => cmd_validate(pipeline),
        Command::Worker => cmd_worker(),
    }
}

async fn cmd_run(
    config: Config,
    pipeline: PathBuf,
    options: RunOptions,
    json: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "batchq".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let pipeline = Pipeline::load(&pipeline)?;
    let pool = match config.isolation {
        Isolation::Process => {
            let worker = ChildCommand::new(std::env::current_exe()?).arg("worker");
            WorkerPool::new(pipeline.isolated_factory(worker)?, config.pool_config())?
        }
        Isolation::Thread => WorkerPool::new(pipeline.processor_factory()?, config.pool_config())?,
    };
    let pool = Arc::new(pool);
    info!(isolation = %config.isolation, workers = pool.size(), "pool ready");
    let console = if json { Console::hidden() } else { Console::new() };

    let result = tokio::select! {
        result = run_pipeline(&pipeline, &pool, &console, &options) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping workers");
            Err(batchq::Error::Cancelled)
        }
    };

    pool.terminate();
    let joining = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || joining.join()).await?;
    info!(respawns = pool.respawns(), "workers stopped");

    let summary = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&console, &summary);
    }
    Ok(())
}

fn print_summary(console: &Console, summary: &RunSummary) {
    console.log(format!(
        "{} files processed, {} skipped",
        summary.files, summary.skipped
    ));
    for stage in &summary.stages {
        let model = stage
            .model
            .as_ref()
            .map(|m| format!(" [{m}]"))
            .unwrap_or_default();
        console.log(format!(
            "  {}{model}: {} items in {:.1}s -> {}",
            stage.name,
            stage.items,
            stage.elapsed_ms as f64 / 1000.0,
            stage.output_dir.display()
        ));
    }
}

fn cmd_worker() -> anyhow::Result<()> {
    // stdout carries replies only; logs go to stderr.
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "batchq-worker".to_string(),
        default_level: config.log_level,
    })?;

    let mut processor = worker_processor_from_env()?;
    serve(&mut processor, std::io::stdin().lock(), std::io::stdout().lock())?;
    Ok(())
}

fn cmd_validate(pipeline: PathBuf) -> anyhow::Result<()> {
    let loaded = Pipeline::load(&pipeline)?;

    println!("{}: ok", pipeline.display());
    if let Some(prepare) = &loaded.prepare {
        println!(
            "  prepare  {:<24} {} -> {}",
            prepare.name,
            prepare.command.join(" "),
            prepare.dir
        );
    }
    for (index, stage) in loaded.stages.iter().enumerate() {
        println!(
            "  stage {}  {:<24} model={} {} -> {}",
            index + 1,
            stage.name,
            stage.model,
            stage.command.join(" "),
            stage.dir_name(index)
        );
    }
    Ok(())
}
