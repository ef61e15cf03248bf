// src/job_manager.rs
//
// =============================================================================
// XTB-FORGE: JOB MANAGER (v 0.1)
// =============================================================================
//
// Accepts submissions, validates them synchronously (spec §7: Validation
// errors never create a job directory), assigns the deterministic job_id
// format, and otherwise reads through to FileStore — the on-disk
// metadata.json remains the single authoritative record (spec §3, §6).

use crate::core::{Job, JobStatus, JobSubmission, OptimizationLevel};
use crate::error::{OrchestratorError, Result};
use crate::filestore::FileStore;
use chrono::Utc;
use std::sync::Arc;

pub struct JobManager {
    filestore: Arc<FileStore>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tag: Option<String>,
}

impl JobManager {
    pub fn new(filestore: Arc<FileStore>) -> Self {
        Self { filestore }
    }

    /// Validates the submission, generates a `job_id`, and writes the
    /// initial `QUEUED` metadata + input XYZ via FileStore. No job
    /// directory is created on validation failure.
    pub async fn submit(&self, req: JobSubmission) -> Result<String> {
        if req.molecule_name.trim().is_empty() {
            return Err(OrchestratorError::Validation("molecule_name must not be empty".to_string()));
        }

        validate_xyz(&req.xyz_content)?;

        let optimization_level = OptimizationLevel::parse(&req.optimization_level).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "optimization_level must be one of crude|normal|tight, got {:?}",
                req.optimization_level
            ))
        })?;

        let now = Utc::now();
        let job_id = generate_job_id(&req.molecule_name, now);

        let job = Job {
            job_id: job_id.clone(),
            molecule_name: req.molecule_name,
            xyz_content: req.xyz_content,
            optimization_level,
            email: req.email,
            tags: req.tags,
            charge: req.charge,
            multiplicity: req.multiplicity,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            error_message: None,
            results: None,
            cancel_requested: false,
        };

        let xyz_name = format!("{}.xyz", sanitize(&job.molecule_name));
        self.filestore.create(&job, &xyz_name).await?;
        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.filestore.read_metadata(job_id).await
    }

    /// Lists jobs most-recently-modified first (FileStore's recommended
    /// order), optionally narrowed by status and/or tag.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let ids = self.filestore.list().await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.filestore.read_metadata(&id).await {
                Ok(job) => {
                    if matches(&job, filter) {
                        jobs.push(job);
                    }
                }
                Err(e) => log::warn!("job_manager: skipping unreadable job {id}: {e}"),
            }
        }
        Ok(jobs)
    }

    /// Marks the job's metadata with a cancellation request. The Worker
    /// Pool observes `cancel_requested` between phases and, for a job that
    /// has not yet been admitted, transitions it directly to `FAILED`
    /// (spec invariant 1: `QUEUED -> FAILED` is an allowed edge for
    /// pre-admission cancellation).
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        self.filestore
            .update_metadata(job_id, |job| {
                job.cancel_requested = true;
                if job.status == JobStatus::Queued {
                    job.fail(OrchestratorError::Cancel.as_job_message());
                }
            })
            .await
    }

    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let job = self.filestore.read_metadata(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(OrchestratorError::Validation(
                "cannot delete a RUNNING job".to_string(),
            ));
        }
        self.filestore.delete(job_id).await
    }
}

fn matches(job: &Job, filter: &JobFilter) -> bool {
    if let Some(status) = filter.status {
        if job.status != status {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !job.tags.contains(tag) {
            return false;
        }
    }
    true
}

/// `<slug(name)>_<YYYYMMDD>_<HHMMSS>_<hex8>` (spec §3, §4.6). `hex8` is 4
/// bytes from a v4 UUID truncated — cryptographically insignificant, just
/// a collision-resistant suffix, so pulling in a second RNG crate beyond
/// `uuid` (already a dependency for its v4 generator) isn't warranted.
fn generate_job_id(molecule_name: &str, now: chrono::DateTime<Utc>) -> String {
    let slug = slugify(molecule_name);
    let timestamp = now.format("%Y%m%d_%H%M%S");
    let suffix = hex::encode(&uuid::Uuid::new_v4().as_bytes()[..4]);
    format!("{slug}_{timestamp}_{suffix}")
}

fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_sep = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

fn sanitize(name: &str) -> String {
    let s = slugify(name);
    if s.is_empty() {
        "molecule".to_string()
    } else {
        s
    }
}

/// Validates the XYZ contract (spec §4.6, §8): first line a positive
/// integer atom count `N`, a comment line, then exactly `N` atom lines of
/// `<element> <x> <y> <z>`. A declared count that disagrees with the atom
/// line count in either direction is rejected (spec §8 boundary behavior).
fn validate_xyz(content: &str) -> Result<()> {
    let mut lines = content.lines();

    let count_line = lines
        .next()
        .ok_or_else(|| OrchestratorError::Validation("xyz_content is empty".to_string()))?;
    let n: usize = count_line
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::Validation(format!("xyz_content: first line must be an atom count, got {:?}", count_line)))?;
    if n == 0 {
        return Err(OrchestratorError::Validation("xyz_content: atom count must be > 0".to_string()));
    }

    lines
        .next()
        .ok_or_else(|| OrchestratorError::Validation("xyz_content: missing comment line".to_string()))?;

    let atom_lines: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).collect();
    if atom_lines.len() != n {
        return Err(OrchestratorError::Validation(format!(
            "xyz_content: declared {n} atoms but found {} atom lines",
            atom_lines.len()
        )));
    }

    for line in atom_lines.iter() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(OrchestratorError::Validation(format!(
                "xyz_content: malformed atom line {:?}",
                line
            )));
        }
        for coord in &fields[1..4] {
            coord.parse::<f64>().map_err(|_| {
                OrchestratorError::Validation(format!("xyz_content: non-numeric coordinate {:?}", coord))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATER_XYZ: &str = "3\nWater\nO 0.000 0.000 0.119\nH 0.000 0.763 -0.477\nH 0.000 -0.763 -0.477\n";

    #[test]
    fn valid_xyz_passes() {
        assert!(validate_xyz(WATER_XYZ).is_ok());
    }

    #[test]
    fn zero_atom_count_is_rejected() {
        let err = validate_xyz("0\ncomment\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn malformed_first_line_is_rejected() {
        let err = validate_xyz("abc\ncomment\nO 0 0 0\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn declared_count_disagreeing_with_atom_lines_is_rejected() {
        let err = validate_xyz("5\ncomment\nO 0 0 0\nH 0 0 0\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn excess_atom_lines_are_also_rejected() {
        let err = validate_xyz("1\ncomment\nO 0 0 0\nH 0 0 0\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn non_numeric_coordinate_is_rejected() {
        let err = validate_xyz("1\ncomment\nO x y z\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn slugify_collapses_non_alphanumeric_runs() {
        assert_eq!(slugify("2,4-Dichlorophenol!!"), "2_4_dichlorophenol");
        assert_eq!(slugify("Water"), "water");
    }

    #[test]
    fn job_id_has_the_documented_shape() {
        let now = Utc::now();
        let id = generate_job_id("Water", now);
        let parts: Vec<&str> = id.split('_').collect();
        // water_YYYYMMDD_HHMMSS_hex8 => at least 4 underscore-separated parts
        assert_eq!(parts[0], "water");
        assert_eq!(parts.last().unwrap().len(), 8);
    }
}
