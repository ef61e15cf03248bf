// src/main.rs
//
// =============================================================================
// XTB-FORGE: COMMANDER & ENTRY POINT (v 0.1)
// =============================================================================
//
// The wiring center of the Quantum Job Orchestration Core.
//
// Modes:
// 1. SERVE:  Boots the Worker Pool against a shared JOBS_DIR/WORKDIR, polling
//            for QUEUED jobs until interrupted.
// 2. SUBMIT: Validates and accepts one job (Job Manager::submit) and prints
//            its job_id.
// 3. STATUS / LIST / CANCEL / DELETE: Thin read-through/administrative
//            commands over the same FileStore the worker pool polls.
//
// Config, FileStore, the DataStore-backed Logging Emitter, and the xTB
// Executor are each constructed exactly once here and handed to the rest of
// the program by `Arc` clone — no component reaches back into `std::env` or
// holds domain state of its own (spec §9 "no global mutable state").

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use xtb_forge::config::Config;
use xtb_forge::core::{JobStatus, JobSubmission};
use xtb_forge::emitter::LoggingEmitter;
use xtb_forge::executor::XtbExecutor;
use xtb_forge::filestore::FileStore;
use xtb_forge::job_manager::{JobFilter, JobManager};
use xtb_forge::worker_pool::WorkerPool;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "xtb-forge",
    version,
    about = "Quantum job orchestration core: xTB dispatch, parsing, and quality assessment"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Worker Pool: poll JOBS_DIR for QUEUED jobs and execute them.
    Serve,

    /// Submit a computation request from an XYZ file.
    Submit {
        /// Human label for the molecule.
        #[arg(long)]
        molecule_name: String,

        /// Path to the input XYZ file.
        #[arg(long)]
        xyz_file: String,

        /// One of crude|normal|tight.
        #[arg(long, default_value = "normal")]
        optimization_level: String,

        /// Net molecular charge.
        #[arg(long, default_value_t = 0)]
        charge: i32,

        /// Spin multiplicity.
        #[arg(long, default_value_t = 1)]
        multiplicity: u32,

        /// Optional submitter email, recorded on the job record.
        #[arg(long)]
        email: Option<String>,

        /// Tags, may be repeated.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Print one job's metadata.json as JSON.
    Status {
        job_id: String,
    },

    /// List jobs, most recently updated first.
    List {
        /// Filter to one status: QUEUED|RUNNING|COMPLETED|FAILED.
        #[arg(long)]
        status: Option<String>,
    },

    /// Request cancellation of a job.
    Cancel {
        job_id: String,
    },

    /// Delete a job's on-disk subtree. Refuses a RUNNING job.
    Delete {
        job_id: String,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env().context("loading configuration from environment")?);
    let filestore = Arc::new(
        FileStore::new(&config.jobs_dir)
            .await
            .context("initializing FileStore")?,
    );
    let job_manager = JobManager::new(filestore.clone());

    match cli.command {
        Commands::Serve => run_worker_pool(config, filestore).await,
        Commands::Submit {
            molecule_name,
            xyz_file,
            optimization_level,
            charge,
            multiplicity,
            email,
            tags,
        } => {
            let xyz_content = std::fs::read_to_string(&xyz_file)
                .with_context(|| format!("reading {xyz_file}"))?;
            let submission = JobSubmission {
                molecule_name,
                xyz_content,
                optimization_level,
                email,
                tags: tags.into_iter().collect(),
                charge,
                multiplicity,
            };
            let job_id = job_manager.submit(submission).await?;
            println!("{job_id}");
            Ok(())
        }
        Commands::Status { job_id } => {
            let job = job_manager.get(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::List { status } => {
            let filter = JobFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                tag: None,
            };
            let jobs = job_manager.list(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Commands::Cancel { job_id } => {
            let job = job_manager.cancel(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::Delete { job_id } => {
            job_manager.delete(&job_id).await?;
            println!("deleted {job_id}");
            Ok(())
        }
    }
}

fn parse_status(s: &str) -> Result<JobStatus> {
    match s.to_uppercase().as_str() {
        "QUEUED" => Ok(JobStatus::Queued),
        "RUNNING" => Ok(JobStatus::Running),
        "COMPLETED" => Ok(JobStatus::Completed),
        "FAILED" => Ok(JobStatus::Failed),
        other => Err(anyhow::anyhow!(
            "--status must be one of QUEUED|RUNNING|COMPLETED|FAILED, got {other:?}"
        )),
    }
}

// ============================================================================
// 3. RUNTIME: WORKER POOL
// ============================================================================

async fn run_worker_pool(config: Arc<Config>, filestore: Arc<FileStore>) -> Result<()> {
    let emitter = Arc::new(
        LoggingEmitter::new(config.datastore.clone()).context("constructing Logging Emitter")?,
    );
    let executor = Arc::new(
        XtbExecutor::new(config.clone(), filestore.clone(), emitter)
            .context("constructing xTB Executor")?,
    );
    let pool = WorkerPool::new(config.clone(), filestore, executor);
    let shutdown = pool.shutdown_handle();

    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("interrupt received, shutting down worker pool");
        shutdown.store(true, Ordering::SeqCst);
    });

    log::info!(
        "worker pool serving: jobs_dir={} work_dir={} max_concurrent={} poll_interval={}s",
        config.jobs_dir.display(),
        config.work_dir.display(),
        config.max_concurrent_jobs,
        config.poll_interval_secs
    );

    pool.run().await;
    log::info!("worker pool shut down cleanly");
    Ok(())
}
