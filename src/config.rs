// src/config.rs
//
// =============================================================================
// XTB-FORGE: CONFIGURATION (v 0.1)
// =============================================================================
//
// Every operational knob is read once, at process start, from the
// environment variables named in the external interface contract. No
// component reaches back into `std::env` at call time — configuration is
// constructed here and passed explicitly into FileStore, DataStoreClient,
// Executor, and WorkerPool at construction, matching the "no global mutable
// state" design principle.

use crate::error::OrchestratorError;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// `JOBS_DIR` — FileStore root.
    pub jobs_dir: PathBuf,
    /// `WORKDIR` — xTB scratch root.
    pub work_dir: PathBuf,
    /// `LOG_DIR` — log directory.
    pub log_dir: PathBuf,
    /// `XTB_PATH` — path to the xTB binary; resolved via `PATH` if unset.
    pub xtb_path: Option<PathBuf>,
    /// `XTB_TIMEOUT` — per-job timeout, seconds.
    pub xtb_timeout_secs: u64,
    /// `MAX_CONCURRENT_JOBS` — per-worker concurrency bound.
    pub max_concurrent_jobs: usize,
    /// `POLL_INTERVAL_SECONDS` — worker poll period.
    pub poll_interval_secs: u64,
    /// `SUPABASE_URL` / `SUPABASE_KEY` — DataStore endpoint and API key.
    /// Both absent is a supported (degraded) mode: Logging Emitter becomes a
    /// no-op rather than refusing to run computations.
    pub datastore: Option<DataStoreConfig>,
}

#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    pub url: String,
    pub key: String,
}

impl Config {
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let jobs_dir = env_path("JOBS_DIR", "./jobs");
        let work_dir = env_path("WORKDIR", "./runs");
        let log_dir = env_path("LOG_DIR", "./logs");

        let xtb_path = env::var("XTB_PATH").ok().map(PathBuf::from);

        let xtb_timeout_secs = env_parse("XTB_TIMEOUT", 3600)?;
        let max_concurrent_jobs = env_parse("MAX_CONCURRENT_JOBS", 3)?;
        let poll_interval_secs = env_parse("POLL_INTERVAL_SECONDS", 5)?;

        let url = env::var("SUPABASE_URL").ok();
        let key = env::var("SUPABASE_KEY").ok();
        let datastore = match (url, key) {
            (Some(url), Some(key)) => Some(DataStoreConfig { url, key }),
            (None, None) => None,
            _ => {
                log::warn!(
                    "SUPABASE_URL/SUPABASE_KEY: only one of the pair is set; treating DataStore as unconfigured"
                );
                None
            }
        };

        Ok(Self {
            jobs_dir,
            work_dir,
            log_dir,
            xtb_path,
            xtb_timeout_secs,
            max_concurrent_jobs,
            poll_interval_secs,
            datastore,
        })
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T>(key: &str, default: T) -> Result<T, OrchestratorError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| OrchestratorError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
