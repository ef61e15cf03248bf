// src/error.rs
//
// =============================================================================
// XTB-FORGE: ERROR TAXONOMY (v 0.1)
// =============================================================================
//
// One variant per row of the error-kind/disposition table: each variant
// carries exactly the fields needed to format the verbatim `error_message`
// strings the job lifecycle requires. `anyhow::Result` is still used at the
// outer call-site boundaries (CLI, worker loop); this typed enum is for the
// subsystem boundaries where callers match on kind (Executor, Parser,
// Quality Assessor, FileStore).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timeout after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("{stderr_tail}")]
    Convergence { exit_code: Option<i32>, stderr_tail: String },

    #[error("unparseable xTB output")]
    Parse,

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("datastore error: {0}")]
    DataStore(String),

    #[error("cancelled")]
    Cancel,

    #[error("orphaned")]
    Orphan,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// The exact message stored in `Job::error_message` for a `FAILED` job.
    /// Every terminal FAILED job carries a non-empty message (spec §7).
    pub fn as_job_message(&self) -> String {
        self.to_string()
    }
}
