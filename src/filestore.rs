// src/filestore.rs
//
// =============================================================================
// XTB-FORGE: FILESTORE (v 0.1)
// =============================================================================
//
// The Job Directory Authority.
//
// Responsibilities:
// 1. Own the on-disk job subtree exclusively: one `<job_id>/` directory per
//    job holding `<name>.xyz`, `metadata.json`, and (iff completed)
//    `results.json` plus any xTB scratch files.
// 2. Atomic metadata/results writes: write-temp, fsync, rename — never an
//    in-place rewrite, so a concurrent reader only ever observes the
//    pre- or post-state of a write, never a torn document.
// 3. Per-job advisory locking for read-modify-write sequences, so two
//    workers racing to admit the same job cannot both win.

use crate::core::Job;
use crate::error::{OrchestratorError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    // One mutex per job_id, created lazily. Guards the read-modify-write
    // sequence for metadata.json within this process; the file is never
    // rewritten in place regardless, so cross-process readers are always
    // safe even without this lock.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FileStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("metadata.json")
    }

    fn results_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("results.json")
    }

    async fn lock_for(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the job subdirectory, writes the input XYZ, and writes the
    /// initial `QUEUED` metadata. Fails if the subdirectory already exists.
    pub async fn create(&self, job: &Job, xyz_name: &str) -> Result<()> {
        let dir = self.job_dir(&job.job_id);
        if dir.exists() {
            return Err(OrchestratorError::Filesystem(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("job directory already exists: {}", dir.display()),
            )));
        }
        fs::create_dir_all(&dir).await?;

        let xyz_path = dir.join(xyz_name);
        write_atomic(&xyz_path, job.xyz_content.as_bytes()).await?;
        write_json_atomic(&self.metadata_path(&job.job_id), job).await?;
        Ok(())
    }

    pub async fn read_metadata(&self, job_id: &str) -> Result<Job> {
        let path = self.metadata_path(job_id);
        let bytes = fs::read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::Filesystem(std::io::Error::other(e)))
    }

    pub async fn write_metadata(&self, job: &Job) -> Result<()> {
        write_json_atomic(&self.metadata_path(&job.job_id), job).await
    }

    /// Read-modify-write under the per-job advisory lock, so concurrent
    /// admission attempts from two workers cannot both transition the same
    /// job: the loser re-reads and observes the winner's state.
    pub async fn update_metadata<F>(&self, job_id: &str, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let lock = self.lock_for(job_id).await;
        let _guard = lock.lock().await;

        let mut job = self.read_metadata(job_id).await?;
        f(&mut job);
        self.write_metadata(&job).await?;
        Ok(job)
    }

    pub async fn save_results(&self, job_id: &str, results: &crate::core::ParsedResult) -> Result<()> {
        write_json_atomic(&self.results_path(job_id), results).await
    }

    pub async fn has_results(&self, job_id: &str) -> bool {
        self.results_path(job_id).exists()
    }

    /// Stable-ordered listing of all job_ids, most-recently-modified first —
    /// the recommended order for the list API.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut dated: Vec<(std::time::SystemTime, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let modified = entry.metadata().await?.modified().unwrap_or(std::time::UNIX_EPOCH);
            if let Some(name) = entry.file_name().to_str() {
                dated.push((modified, name.to_string()));
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, id)| id).collect())
    }

    /// Recursive removal; must succeed even if subprocess scratch files
    /// remain in the job directory.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Write-temp, fsync, rename. Guarantees a reader observes either the
/// pre- or post-state of the write, never a partial document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        OrchestratorError::Filesystem(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent",
        ))
    })?;
    let tmp_path = path.with_extension(tmp_extension(path));
    let bytes = bytes.to_vec();
    let tmp_path_blocking = tmp_path.clone();

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut f = std::fs::File::create(&tmp_path_blocking)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| OrchestratorError::Filesystem(std::io::Error::other(e)))??;

    fs::rename(&tmp_path, path).await?;

    // Best-effort directory fsync so the rename is durable on crash-prone
    // filesystems; failures here are not fatal to correctness.
    if let Ok(dir_file) = std::fs::File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| OrchestratorError::Filesystem(std::io::Error::other(e)))?;
    write_atomic(path, &json).await
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}
