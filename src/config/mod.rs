//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Every variable
//! is optional; CLI flags override what is read here.

use std::str::FromStr;
use std::time::Duration;

use crate::engine::PoolConfig;
use crate::error::{Error, Result};
use crate::runner::default_concurrency;

/// Where a worker's processor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// In a worker process of its own; a crash there costs one worker.
    #[default]
    Process,
    /// Inside the worker thread.
    Thread,
}

impl FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Isolation::Process),
            "thread" => Ok(Isolation::Thread),
            other => Err(Error::Config(format!(
                "unknown isolation {other:?}, expected \"process\" or \"thread\""
            ))),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::Process => write!(f, "process"),
            Isolation::Thread => write!(f, "thread"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Workers in the pool (`BATCHQ_WORKERS`).
    pub workers: usize,
    /// `BATCHQ_ISOLATION`: `process` (default) or `thread`.
    pub isolation: Isolation,
    /// Prepare-step jobs running at once (`BATCHQ_CONCURRENCY`).
    pub concurrency: usize,
    pub watch_interval: Duration,
    pub poll_timeout: Duration,
    pub max_retries: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workers = parsed_var("BATCHQ_WORKERS")?.unwrap_or(1);
        if workers == 0 {
            return Err(Error::Config("BATCHQ_WORKERS must be at least 1".to_string()));
        }
        let concurrency = parsed_var("BATCHQ_CONCURRENCY")?
            .unwrap_or_else(default_concurrency)
            .max(1);

        Ok(Self {
            workers,
            isolation: parsed_var("BATCHQ_ISOLATION")?.unwrap_or_default(),
            concurrency,
            watch_interval: millis_var("BATCHQ_WATCH_INTERVAL_MS", 50)?,
            poll_timeout: millis_var("BATCHQ_POLL_TIMEOUT_MS", 100)?,
            max_retries: parsed_var("BATCHQ_MAX_RETRIES")?.unwrap_or(3),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            watch_interval: self.watch_interval,
            poll_timeout: self.poll_timeout,
            max_retries: self.max_retries,
            ..PoolConfig::default()
        }
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn millis_var(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parsed_var(name)?.unwrap_or(default)))
}
