// src/quality.rs
//
// =============================================================================
// XTB-FORGE: QUALITY ASSESSOR (v 0.1)
// =============================================================================
//
// Scores a completed calculation's result along four dimensions and
// combines them into one `overall_quality_score`, gating whether the
// record is fit to enter an ML training set (`is_ml_ready`). Scoring is a
// pure function of its inputs plus the rolling sample it's handed —
// running it twice on the same result and the same sample produces the
// same score, which the Worker Pool relies on when retrying a failed
// emission.

use crate::core::{ConvergenceStatus, ParsedResult, QualityMetrics};
use chrono::Utc;
use std::collections::VecDeque;

const WEIGHT_COMPLETENESS: f64 = 0.25;
const WEIGHT_VALIDITY: f64 = 0.35;
const WEIGHT_CONSISTENCY: f64 = 0.30;
const WEIGHT_UNIQUENESS: f64 = 0.10;

/// Energies within this many eV of each other in the rolling sample are
/// treated as duplicates for the uniqueness dimension.
const DUPLICATE_ENERGY_EPSILON: f64 = 1e-6;

/// Z-score magnitude above which an energy is flagged an outlier.
const OUTLIER_Z_THRESHOLD: f64 = 3.0;

/// Below this count, z-score is meaningless; fall back to the absolute
/// implausibility check instead of declaring every result non-outlier.
const MIN_SAMPLE_FOR_OUTLIER: usize = 8;

/// Absent enough rolling-sample history, an energy outside this Hartree
/// range is implausible for the molecule sizes this system targets (spec
/// §4.4: "absent a sample, an absolute implausibility check").
const PLAUSIBLE_ENERGY_RANGE: std::ops::RangeInclusive<f64> = -5000.0..=-1.0;

const ML_READY_THRESHOLD: f64 = 0.80;

/// A bounded, per-process history of recent energies used for outlier and
/// uniqueness detection. Not persisted: a process restart resets the
/// sample, which only widens the "not enough history yet" window rather
/// than producing wrong answers.
pub struct RollingSample {
    energies: VecDeque<f64>,
    capacity: usize,
}

impl RollingSample {
    pub fn new(capacity: usize) -> Self {
        Self {
            energies: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, energy: f64) {
        if self.energies.len() == self.capacity {
            self.energies.pop_front();
        }
        self.energies.push_back(energy);
    }

    fn mean(&self) -> f64 {
        self.energies.iter().sum::<f64>() / self.energies.len() as f64
    }

    fn std_dev(&self, mean: f64) -> f64 {
        let variance = self
            .energies
            .iter()
            .map(|e| (e - mean).powi(2))
            .sum::<f64>()
            / self.energies.len() as f64;
        variance.sqrt()
    }

    fn z_score(&self, energy: f64) -> Option<f64> {
        if self.energies.len() < MIN_SAMPLE_FOR_OUTLIER {
            return None;
        }
        let mean = self.mean();
        let std = self.std_dev(mean);
        if std == 0.0 {
            return Some(0.0);
        }
        Some((energy - mean) / std)
    }

    /// Fallback used in place of the z-score test when there isn't enough
    /// rolling history yet: an energy outside the plausible range for this
    /// system's target molecule sizes is flagged directly.
    fn is_implausible(&self, energy: f64) -> bool {
        self.energies.len() < MIN_SAMPLE_FOR_OUTLIER && !PLAUSIBLE_ENERGY_RANGE.contains(&energy)
    }

    /// IQR test as a second, distribution-shape-robust outlier signal: an
    /// energy more than 1.5x the interquartile range beyond either quartile.
    fn iqr_outlier(&self, energy: f64) -> bool {
        if self.energies.len() < MIN_SAMPLE_FOR_OUTLIER {
            return false;
        }
        let mut sorted: Vec<f64> = self.energies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let q1 = percentile(&sorted, 0.25);
        let q3 = percentile(&sorted, 0.75);
        let iqr = q3 - q1;
        energy < q1 - 1.5 * iqr || energy > q3 + 1.5 * iqr
    }

    fn has_near_duplicate(&self, energy: f64) -> bool {
        self.energies
            .iter()
            .any(|e| (e - energy).abs() < DUPLICATE_ENERGY_EPSILON)
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = idx - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

pub struct Assessment {
    pub metrics: QualityMetrics,
    pub is_ml_ready: bool,
}

/// Scores one parsed result. `entity_type`/`entity_id` are stamped into the
/// returned `QualityMetrics` row as-is for the Logging Emitter to persist.
pub fn assess(
    result: &ParsedResult,
    sample: &mut RollingSample,
    entity_type: &str,
    entity_id: i64,
) -> Assessment {
    let mut missing_fields = Vec::new();

    let completeness = completeness_score(result, &mut missing_fields);
    let validity = validity_score(result);
    let consistency = consistency_score(result);

    let (uniqueness, is_outlier) = match result.energy {
        Some(energy) => {
            let dup = sample.has_near_duplicate(energy);
            let outlier = match sample.z_score(energy) {
                Some(z) => z.abs() > OUTLIER_Z_THRESHOLD,
                None => sample.is_implausible(energy),
            } || sample.iqr_outlier(energy);
            sample.push(energy);
            (if dup { 0.0 } else { 1.0 }, outlier)
        }
        None => (0.0, false),
    };

    let overall = WEIGHT_COMPLETENESS * completeness
        + WEIGHT_VALIDITY * validity
        + WEIGHT_CONSISTENCY * consistency
        + WEIGHT_UNIQUENESS * uniqueness;

    let has_missing_values = !missing_fields.is_empty();
    let failed_validation = validity < 0.5;
    let is_suspicious = is_outlier || failed_validation;
    let is_ml_ready = overall >= ML_READY_THRESHOLD && !failed_validation && !is_outlier;

    let metrics = QualityMetrics {
        entity_type: entity_type.to_string(),
        entity_id,
        completeness_score: completeness,
        validity_score: validity,
        consistency_score: consistency,
        uniqueness_score: uniqueness,
        overall_quality_score: overall,
        is_outlier,
        is_suspicious,
        has_missing_values,
        failed_validation,
        missing_fields,
        data_source: "xtb".to_string(),
        validation_method: "xtb_forge.quality.assess".to_string(),
        validation_timestamp: Utc::now(),
    };

    Assessment { metrics, is_ml_ready }
}

/// Fraction of the required + optional fields (spec §4.4) that are present.
/// Required: energy, gap, homo, lumo. Optional: dipole, charges, forces,
/// optimized_geometry.
fn completeness_score(result: &ParsedResult, missing_fields: &mut Vec<String>) -> f64 {
    let checks: [(&str, bool); 8] = [
        ("energy", result.energy.is_some()),
        ("gap", result.gap.is_some()),
        ("homo", result.homo.is_some()),
        ("lumo", result.lumo.is_some()),
        ("dipole", result.dipole.is_some()),
        ("charges", result.charges.is_some()),
        ("forces", result.forces.is_some()),
        ("optimized_geometry", result.optimized_geometry.is_some()),
    ];
    let present = checks.iter().filter(|(_, ok)| *ok).count();
    for (name, ok) in &checks {
        if !ok {
            missing_fields.push(name.to_string());
        }
    }
    present as f64 / checks.len() as f64
}

/// Fraction of *present* fields that satisfy their range constraint (spec
/// §4.4, authoritative table): `energy < 0`; `0 < gap < 50`; `-50 <= homo
/// <= 0`; `-20 <= lumo <= 20`; `0 <= dipole <= 20`; per-atom `|charge| <=
/// 2`; per-atom force magnitude in `[0, 100]`.
fn validity_score(result: &ParsedResult) -> f64 {
    let mut checks_passed = 0usize;
    let mut checks_total = 0usize;

    let mut check = |present: bool, ok: bool| {
        if present {
            checks_total += 1;
            if ok {
                checks_passed += 1;
            }
        }
    };

    check(
        result.energy.is_some(),
        result.energy.map(|e| e.is_finite() && e < 0.0).unwrap_or(false),
    );
    check(
        result.gap.is_some(),
        result
            .gap
            .map(|g| g.is_finite() && g > 0.0 && g < 50.0)
            .unwrap_or(false),
    );
    check(
        result.homo.is_some(),
        result
            .homo
            .map(|h| h.is_finite() && (-50.0..=0.0).contains(&h))
            .unwrap_or(false),
    );
    check(
        result.lumo.is_some(),
        result
            .lumo
            .map(|l| l.is_finite() && (-20.0..=20.0).contains(&l))
            .unwrap_or(false),
    );
    check(
        result.dipole.is_some(),
        result
            .dipole
            .map(|d| d.is_finite() && (0.0..=20.0).contains(&d))
            .unwrap_or(false),
    );

    if let Some(charges) = &result.charges {
        checks_total += 1;
        if charges.iter().all(|c| c.is_finite() && c.abs() <= 2.0) {
            checks_passed += 1;
        }
    }
    if let Some(forces) = &result.forces {
        checks_total += 1;
        if forces.iter().all(|f| f.is_finite() && (0.0..=100.0).contains(f)) {
            checks_passed += 1;
        }
    }

    if checks_total == 0 {
        return 0.0;
    }
    checks_passed as f64 / checks_total as f64
}

/// Fraction of applicable cross-field rules (spec §4.4) satisfied:
/// `homo < lumo`; `|gap - (lumo - homo)| < 0.01`; `convergence_status ==
/// "converged"` implies `energy` is present.
fn consistency_score(result: &ParsedResult) -> f64 {
    let mut checks_passed = 0usize;
    let mut checks_total = 0usize;

    if let (Some(homo), Some(lumo)) = (result.homo, result.lumo) {
        checks_total += 1;
        if homo < lumo {
            checks_passed += 1;
        }
    }

    if let (Some(gap), Some(homo), Some(lumo)) = (result.gap, result.homo, result.lumo) {
        checks_total += 1;
        if (gap - (lumo - homo)).abs() < 0.01 {
            checks_passed += 1;
        }
    }

    if let Some(status) = &result.convergence_status {
        if ConvergenceStatus::from_str_loose(status) == ConvergenceStatus::Converged {
            checks_total += 1;
            if result.energy.is_some() {
                checks_passed += 1;
            }
        }
    }

    if checks_total == 0 {
        // Nothing to cross-check is neither consistent nor inconsistent;
        // treat as neutral rather than penalizing sparse results twice.
        return 1.0;
    }
    checks_passed as f64 / checks_total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(energy: f64) -> ParsedResult {
        ParsedResult {
            energy: Some(energy),
            gap: Some(3.5),
            homo_lumo_gap: Some(3.5),
            homo: Some(-7.5),
            lumo: Some(-4.0),
            dipole: Some(1.2),
            convergence_status: Some("converged".to_string()),
            atom_count: Some(5),
            optimized_geometry: Some("5\ncomment\n".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn complete_consistent_result_scores_high() {
        let mut sample = RollingSample::new(64);
        let assessment = assess(&sample_result(-50.0), &mut sample, "calculation", 1);
        assert!(assessment.metrics.overall_quality_score > 0.9);
        assert!(assessment.is_ml_ready);
        assert!(!assessment.metrics.is_outlier);
    }

    #[test]
    fn empty_result_is_not_ml_ready() {
        let mut sample = RollingSample::new(64);
        let assessment = assess(&ParsedResult::default(), &mut sample, "calculation", 1);
        // Completeness and validity both bottom out at 0; consistency is
        // vacuously 1.0 (no cross-field rule applies to an empty result).
        assert!(assessment.metrics.overall_quality_score < 0.80);
        assert!(!assessment.is_ml_ready);
        assert!(assessment.metrics.has_missing_values);
        assert!(assessment.metrics.failed_validation);
    }

    #[test]
    fn outlier_energy_flagged_after_enough_history() {
        let mut sample = RollingSample::new(64);
        for _ in 0..MIN_SAMPLE_FOR_OUTLIER {
            assess(&sample_result(-50.0), &mut sample, "calculation", 1);
        }
        let assessment = assess(&sample_result(-5000.0), &mut sample, "calculation", 1);
        assert!(assessment.metrics.is_outlier);
        assert!(!assessment.is_ml_ready);
    }

    #[test]
    fn implausible_energy_flagged_before_enough_history_for_zscore() {
        let mut sample = RollingSample::new(64);
        // Below MIN_SAMPLE_FOR_OUTLIER, so the absolute implausibility
        // check fires instead of the z-score test.
        let assessment = assess(&sample_result(-0.5), &mut sample, "calculation", 1);
        assert!(assessment.metrics.is_outlier);
    }

    #[test]
    fn plausible_energy_not_flagged_before_enough_history() {
        let mut sample = RollingSample::new(64);
        let assessment = assess(&sample_result(-50.0), &mut sample, "calculation", 1);
        assert!(!assessment.metrics.is_outlier);
    }

    #[test]
    fn near_duplicate_energy_scores_zero_uniqueness() {
        let mut sample = RollingSample::new(64);
        assess(&sample_result(-50.0), &mut sample, "calculation", 1);
        let assessment = assess(&sample_result(-50.0), &mut sample, "calculation", 1);
        assert_eq!(assessment.metrics.uniqueness_score, 0.0);
    }

    #[test]
    fn inconsistent_gap_lowers_consistency() {
        let mut result = sample_result(-50.0);
        result.lumo = Some(10.0); // gap no longer matches lumo - homo
        let mut sample = RollingSample::new(64);
        let assessment = assess(&result, &mut sample, "calculation", 1);
        assert!(assessment.metrics.consistency_score < 1.0);
    }
}
