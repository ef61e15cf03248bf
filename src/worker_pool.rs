// src/worker_pool.rs
//
// =============================================================================
// XTB-FORGE: WORKER POOL (v 0.1)
// =============================================================================
//
// Polls FileStore for QUEUED jobs, admits up to `max_concurrent_jobs` of
// them under a semaphore — the same bounded-concurrency shape as the
// teacher's `NodeGuardian::task_limiter` — and spawns each admission on its
// own task so the poll loop never blocks on a running computation (spec
// §4.7, §5).

use crate::config::Config;
use crate::core::JobStatus;
use crate::error::OrchestratorError;
use crate::executor::XtbExecutor;
use crate::filestore::FileStore;
use chrono::Utc;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration};

/// Orphan-recovery policy (spec §4.7 Open Question, decided in DESIGN.md):
/// a job left `RUNNING` across a worker restart is auto-failed once its
/// `updated_at` is older than `2 * timeout`, rather than left for an
/// operator. Per-process state is not required for this check since it is
/// re-derived from on-disk timestamps on every poll.
fn orphan_threshold(timeout_secs: u64) -> chrono::Duration {
    chrono::Duration::seconds((2 * timeout_secs) as i64)
}

pub struct WorkerPool {
    config: Arc<Config>,
    filestore: Arc<FileStore>,
    executor: Arc<XtbExecutor>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: Arc<Config>, filestore: Arc<FileStore>, executor: Arc<XtbExecutor>) -> Self {
        let max_concurrent = config.max_concurrent_jobs.max(1);
        Self {
            config,
            filestore,
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the poll/admit/execute/health loop until `shutdown` is set.
    pub async fn run(&self) {
        let mut poll_tick = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let mut health_tick = interval(Duration::from_secs(30));

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll_tick.tick() => {
                    if let Err(e) = self.reap_orphans().await {
                        log::warn!("worker pool: orphan sweep failed: {e}");
                    }
                    if let Err(e) = self.poll_and_admit().await {
                        log::warn!("worker pool: poll failed: {e}");
                    }
                }
                _ = health_tick.tick() => {
                    log::info!(
                        "worker pool health: active = {}/{}",
                        self.active.load(Ordering::SeqCst),
                        self.config.max_concurrent_jobs
                    );
                }
            }
        }
    }

    /// One poll cycle: lists QUEUED jobs FIFO by `created_at`, admits as
    /// many as there are free permits. Admission loses a race gracefully —
    /// the losing worker observes `RUNNING` on re-read and releases its
    /// permit without spawning (spec invariant 5).
    async fn poll_and_admit(&self) -> crate::error::Result<()> {
        let ids = self.filestore.list().await?;
        let mut queued = Vec::new();
        for id in ids {
            match self.filestore.read_metadata(&id).await {
                Ok(job) if job.status == JobStatus::Queued => queued.push(job),
                Ok(_) => {}
                Err(e) => log::warn!("worker pool: skipping unreadable job {id}: {e}"),
            }
        }
        queued.sort_by_key(|j| j.created_at);

        for job in queued {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            let job_id = job.job_id.clone();
            let admitted = Cell::new(false);
            let result = self
                .filestore
                .update_metadata(&job_id, |j| {
                    if j.cancel_requested {
                        j.fail(OrchestratorError::Cancel.as_job_message());
                    } else if j.status == JobStatus::Queued {
                        j.status = JobStatus::Running;
                        j.updated_at = Utc::now();
                        admitted.set(true);
                    }
                })
                .await;

            if !matches!(result, Ok(_)) || !admitted.get() {
                drop(permit);
                continue;
            }

            let executor = self.executor.clone();
            let active = self.active.clone();
            active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                executor.run(&job_id).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        Ok(())
    }

    /// Auto-fails jobs stuck `RUNNING` since before `now - 2*timeout`
    /// (decided orphan policy, spec §4.7/§9 Open Question).
    async fn reap_orphans(&self) -> crate::error::Result<()> {
        let threshold = orphan_threshold(self.config.xtb_timeout_secs);
        let ids = self.filestore.list().await?;
        for id in ids {
            let job = match self.filestore.read_metadata(&id).await {
                Ok(j) => j,
                Err(_) => continue,
            };
            if job.status == JobStatus::Running && Utc::now() - job.updated_at > threshold {
                let id_for_log = id.clone();
                let _ = self
                    .filestore
                    .update_metadata(&id, |j| {
                        if j.status == JobStatus::Running {
                            j.fail(OrchestratorError::Orphan.as_job_message());
                        }
                    })
                    .await;
                log::warn!("worker pool: job {id_for_log} orphaned (stale RUNNING), marked FAILED");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_threshold_is_twice_the_timeout() {
        assert_eq!(orphan_threshold(3600), chrono::Duration::seconds(7200));
    }
}
