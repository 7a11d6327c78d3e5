//! Service configuration from environment variables.
//!
//! `.env` files are honoured through `dotenvy` before the environment is read.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::engine::WorkerPoolConfig;
use crate::vendor::DEFAULT_MAX_QUERY_PAGES;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:cloud-ingest.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Runtime settings of the ingest service.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// `DATABASE_URL`
    pub database_url: String,
    /// `INGEST_LOG_DIR`
    pub log_dir: PathBuf,
    /// `INGEST_LOG_JSON`: write the log file as JSON lines.
    pub log_json: bool,
    /// `INGEST_POLL_WORKERS`
    pub poll_workers: usize,
    /// `INGEST_RAKE_WORKERS`
    pub rake_workers: usize,
    /// `INGEST_CLAIM_INTERVAL_SECS`
    pub claim_interval: Duration,
    /// `INGEST_SHUTDOWN_TIMEOUT_SECS`
    pub shutdown_timeout: Duration,
    /// `INGEST_ABANDONED_AGE_SECS`: claimed/executing tasks older than this are reset.
    pub abandoned_age: Duration,
    /// `INGEST_ABANDONED_CHECK_SECS`
    pub abandoned_check_interval: Duration,
    /// `INGEST_MAX_QUERY_PAGES`
    pub max_query_pages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_json: false,
            poll_workers: 4,
            rake_workers: 4,
            claim_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            abandoned_age: Duration::from_secs(60 * 60),
            abandoned_check_interval: Duration::from_secs(5 * 60),
            max_query_pages: DEFAULT_MAX_QUERY_PAGES,
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir: get("INGEST_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_json: parse_or(&get, "INGEST_LOG_JSON", defaults.log_json)?,
            poll_workers: parse_or(&get, "INGEST_POLL_WORKERS", defaults.poll_workers)?,
            rake_workers: parse_or(&get, "INGEST_RAKE_WORKERS", defaults.rake_workers)?,
            claim_interval: secs_or(&get, "INGEST_CLAIM_INTERVAL_SECS", defaults.claim_interval)?,
            shutdown_timeout: secs_or(
                &get,
                "INGEST_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
            abandoned_age: secs_or(&get, "INGEST_ABANDONED_AGE_SECS", defaults.abandoned_age)?,
            abandoned_check_interval: secs_or(
                &get,
                "INGEST_ABANDONED_CHECK_SECS",
                defaults.abandoned_check_interval,
            )?,
            max_query_pages: parse_or(&get, "INGEST_MAX_QUERY_PAGES", defaults.max_query_pages)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_workers == 0 || self.rake_workers == 0 {
            return Err(Error::config("worker counts must be at least 1"));
        }
        if self.max_query_pages == 0 {
            return Err(Error::config("INGEST_MAX_QUERY_PAGES must be at least 1"));
        }
        if self.claim_interval.is_zero() {
            return Err(Error::config("INGEST_CLAIM_INTERVAL_SECS must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_pool(&self) -> WorkerPoolConfig {
        self.pool_config(self.poll_workers)
    }

    pub fn rake_pool(&self) -> WorkerPoolConfig {
        self.pool_config(self.rake_workers)
    }

    fn pool_config(&self, max_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers,
            claim_interval_ms: self.claim_interval.as_millis() as u64,
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {key}='{raw}': {e}"))),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
