// src/core.rs
//
// =============================================================================
// XTB-FORGE: CORE SCHEMA AUTHORITY (v 0.1)
// =============================================================================
//
// The data contracts shared by every component: Job (the on-disk, authoritative
// lifecycle record), the DataStore row shapes (Molecule, Calculation,
// QualityMetrics, Lineage), and the Parser Cascade's canonical output map.
//
// Design Principles:
// 1. JSON is the wire and on-disk format throughout; every type here derives
//    Serialize/Deserialize.
// 2. `Job` owns the full lifecycle; `results` mirrors `results.json` and must
//    never be synthesized when that file is absent (the API-layer guarantee
//    lives at the FileStore boundary, see filestore.rs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ============================================================================
// 1. JOB LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Crude,
    Normal,
    Tight,
}

impl OptimizationLevel {
    pub fn as_xtb_arg(&self) -> &'static str {
        match self {
            OptimizationLevel::Crude => "crude",
            OptimizationLevel::Normal => "normal",
            OptimizationLevel::Tight => "tight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crude" => Some(Self::Crude),
            "normal" => Some(Self::Normal),
            "tight" => Some(Self::Tight),
            _ => None,
        }
    }
}

/// The authoritative, on-disk job record (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub molecule_name: String,
    pub xyz_content: String,
    pub optimization_level: OptimizationLevel,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub charge: i32,
    #[serde(default = "default_multiplicity")]
    pub multiplicity: u32,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub results: Option<ParsedResult>,

    /// Set by Job Manager::cancel; observed by the Worker Pool between phases.
    #[serde(default)]
    pub cancel_requested: bool,
}

fn default_multiplicity() -> u32 {
    1
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.results = None;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, results: ParsedResult) {
        self.status = JobStatus::Completed;
        self.results = Some(results);
        self.error_message = None;
        self.updated_at = Utc::now();
    }
}

/// A request accepted by the Job Manager's `submit` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub molecule_name: String,
    pub xyz_content: String,
    pub optimization_level: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub charge: i32,
    #[serde(default = "default_multiplicity")]
    pub multiplicity: u32,
}

// ============================================================================
// 2. PARSER CASCADE OUTPUT
// ============================================================================

/// The canonical key set produced by any Parser Cascade strategy. Any subset
/// of fields may be present; only `energy` is required for a `COMPLETED` job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParsedResult {
    pub energy: Option<f64>,        // Hartree
    pub homo_lumo_gap: Option<f64>, // eV
    pub gap: Option<f64>,           // eV, alias of homo_lumo_gap
    pub homo: Option<f64>,          // eV
    pub lumo: Option<f64>,          // eV
    pub dipole: Option<f64>,        // Debye
    #[serde(default)]
    pub charges: Option<Vec<f64>>,
    #[serde(default)]
    pub forces: Option<Vec<f64>>, // per-atom force magnitudes, kcal/mol/A
    #[serde(default)]
    pub optimized_geometry: Option<String>,
    #[serde(default)]
    pub convergence_status: Option<String>,
    #[serde(default)]
    pub atom_count: Option<usize>,
    #[serde(default)]
    pub gradient_norm: Option<f64>,
    /// True when `homo`/`lumo` were derived from the §9 HOMO=-7.5eV heuristic
    /// rather than reported directly by xTB.
    #[serde(default)]
    pub homo_estimated: bool,
}

impl ParsedResult {
    pub fn has_energy(&self) -> bool {
        self.energy.is_some()
    }
}

// ============================================================================
// 3. DATASTORE ROW SHAPES (§3)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Molecule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub smiles: String,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    NotConverged,
    Error,
}

impl ConvergenceStatus {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "converged" => Self::Converged,
            "not_converged" | "notconverged" => Self::NotConverged,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::NotConverged => "not_converged",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub molecule_id: i64,
    pub energy: f64,
    pub homo: f64,
    pub lumo: f64,
    pub gap: f64,
    pub dipole: f64,
    pub execution_time_seconds: f64,
    pub xtb_version: String,
    pub method: String,
    pub convergence_status: String,
    pub quality_score: f64,
    pub is_ml_ready: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub entity_type: String,
    pub entity_id: i64,
    pub completeness_score: f64,
    pub validity_score: f64,
    pub consistency_score: f64,
    pub uniqueness_score: f64,
    pub overall_quality_score: f64,
    pub is_outlier: bool,
    pub is_suspicious: bool,
    pub has_missing_values: bool,
    pub failed_validation: bool,
    pub missing_fields: Vec<String>,
    pub data_source: String,
    pub validation_method: String,
    pub validation_timestamp: DateTime<Utc>,
}

/// Derives the integer `entity_id` quality/lineage rows carry (§9) from a
/// `job_id`'s trailing `hex8` suffix: interpreted as base-16 and reduced
/// modulo 1e8 to fit the datastore's integer column. Lossy by design —
/// `job_id` remains the authoritative correlation key in
/// `Lineage::source_reference`; collisions here are possible but tolerated.
pub fn entity_id_from_job_id(job_id: &str) -> i64 {
    let hex_suffix = job_id.rsplit('_').next().unwrap_or(job_id);
    let value = u64::from_str_radix(hex_suffix, 16).unwrap_or(0);
    (value % 100_000_000) as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub entity_type: String,
    pub entity_id: i64,
    pub source_type: String,
    pub source_reference: String,
    pub software_version: String,
    pub algorithm_version: String,
    pub processing_parameters: HashMap<String, serde_json::Value>,
    pub approved_for_ml: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_derives_from_hex_suffix() {
        assert_eq!(entity_id_from_job_id("water_20260728_120000_000000ff"), 0xff);
        // Large hex suffixes reduce modulo 1e8 rather than overflowing.
        assert_eq!(entity_id_from_job_id("water_20260728_120000_ffffffff"), (0xffffffffu64 % 100_000_000) as i64);
    }

    #[test]
    fn entity_id_falls_back_to_zero_on_malformed_suffix() {
        assert_eq!(entity_id_from_job_id("not_hex_at_all_zzzz"), 0);
    }

    #[test]
    fn optimization_level_round_trips_through_str() {
        for level in [OptimizationLevel::Crude, OptimizationLevel::Normal, OptimizationLevel::Tight] {
            let parsed = OptimizationLevel::parse(level.as_xtb_arg()).unwrap();
            assert_eq!(parsed.as_xtb_arg(), level.as_xtb_arg());
        }
        assert!(OptimizationLevel::parse("bogus").is_none());
    }
}
