// src/emitter.rs
//
// =============================================================================
// XTB-FORGE: LOGGING EMITTER (v 0.1)
// =============================================================================
//
// Pushes the four provenance record types to DataStore after a successful
// run: molecules (deduped by smiles), calculations, quality metrics, and
// lineage. Each emission is independent and best-effort — the job's
// on-disk state is already authoritative by the time this runs, so a
// DataStore outage degrades provenance, not correctness (spec §4.8, §7).

use crate::config::DataStoreConfig;
use crate::core::{Calculation, Job, Lineage, Molecule, ParsedResult, QualityMetrics};
use crate::datastore::{DataStoreClient, DataStoreError, DataStoreResult, Filter, Query};
use crate::quality::Assessment;
use std::collections::HashMap;

const ALGORITHM_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct LoggingEmitter {
    client: Option<DataStoreClient>,
}

impl LoggingEmitter {
    /// `None` config degrades to a no-op emitter that logs once and never
    /// touches the network, rather than refusing to run computations
    /// (spec §6, §9 "no global mutable state" — the degraded mode is a
    /// value, constructed once, not a runtime feature flag).
    pub fn new(cfg: Option<DataStoreConfig>) -> DataStoreResult<Self> {
        let client = cfg.as_ref().map(DataStoreClient::new).transpose()?;
        if client.is_none() {
            log::warn!("SUPABASE_URL/SUPABASE_KEY not set: Logging Emitter running in no-op mode");
        }
        Ok(Self { client })
    }

    /// Emits all four records for one completed job. Every emission is
    /// independent: a failure partway through is logged and swallowed so
    /// the remaining emissions still run (spec §4.8).
    pub async fn emit_all(&self, job: &Job, result: &ParsedResult, assessment: &Assessment, execution_time_secs: f64) {
        let Some(client) = &self.client else {
            return;
        };

        let molecule = match self.upsert_molecule(client, &job.molecule_name).await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("job {}: molecule upsert failed: {e}", job.job_id);
                return;
            }
        };

        let Some(molecule_id) = molecule.id else {
            log::warn!("job {}: molecule upsert returned no id", job.job_id);
            return;
        };

        if let Err(e) = self
            .insert_calculation(client, molecule_id, result, assessment, execution_time_secs)
            .await
        {
            log::warn!("job {}: calculation insert failed: {e}", job.job_id);
        }

        if let Err(e) = self.insert_quality_metrics(client, &assessment.metrics).await {
            log::warn!("job {}: quality metrics insert failed: {e}", job.job_id);
        }

        if let Err(e) = self
            .insert_lineage(client, job, result, assessment.metrics.entity_id, assessment.is_ml_ready)
            .await
        {
            log::warn!("job {}: lineage insert failed: {e}", job.job_id);
        }
    }

    async fn upsert_molecule(&self, client: &DataStoreClient, molecule_name: &str) -> DataStoreResult<Molecule> {
        let query = Query {
            filters: vec![Filter::eq("smiles", molecule_name)],
            limit: Some(1),
            ..Default::default()
        };
        let existing: Vec<Molecule> = client.get("molecules", &query).await?;
        if let Some(m) = existing.into_iter().next() {
            return Ok(m);
        }

        let row = Molecule {
            id: None,
            name: molecule_name.to_string(),
            smiles: molecule_name.to_string(),
            formula: None,
            user_id: None,
            created_at: None,
        };
        client.insert("molecules", &row).await
    }

    async fn insert_calculation(
        &self,
        client: &DataStoreClient,
        molecule_id: i64,
        result: &ParsedResult,
        assessment: &Assessment,
        execution_time_secs: f64,
    ) -> DataStoreResult<Calculation> {
        let row = Calculation {
            id: None,
            molecule_id,
            energy: result.energy.unwrap_or_default(),
            homo: result.homo.unwrap_or_default(),
            lumo: result.lumo.unwrap_or_default(),
            gap: result.gap.unwrap_or_default(),
            dipole: result.dipole.unwrap_or_default(),
            execution_time_seconds: execution_time_secs,
            xtb_version: "xtb_6.7.1".to_string(),
            method: "GFN2-xTB".to_string(),
            convergence_status: result
                .convergence_status
                .clone()
                .unwrap_or_else(|| "error".to_string()),
            quality_score: assessment.metrics.overall_quality_score,
            is_ml_ready: assessment.is_ml_ready,
            created_at: None,
        };
        client.insert("calculations", &row).await
    }

    async fn insert_quality_metrics(&self, client: &DataStoreClient, metrics: &QualityMetrics) -> DataStoreResult<()> {
        let _: QualityMetrics = client.insert("data_quality_metrics", metrics).await?;
        Ok(())
    }

    async fn insert_lineage(
        &self,
        client: &DataStoreClient,
        job: &Job,
        result: &ParsedResult,
        entity_id: i64,
        approved_for_ml: bool,
    ) -> DataStoreResult<()> {
        let mut processing_parameters = HashMap::new();
        processing_parameters.insert(
            "optimization_level".to_string(),
            serde_json::json!(job.optimization_level.as_xtb_arg()),
        );
        processing_parameters.insert("charge".to_string(), serde_json::json!(job.charge));
        processing_parameters.insert("multiplicity".to_string(), serde_json::json!(job.multiplicity));
        processing_parameters.insert("homo_estimated".to_string(), serde_json::json!(result.homo_estimated));

        let lineage = Lineage {
            entity_type: "calculations".to_string(),
            entity_id,
            source_type: "computation".to_string(),
            source_reference: format!("xtb_forge job {}", job.job_id),
            software_version: "xtb_6.7.1".to_string(),
            algorithm_version: ALGORITHM_VERSION.to_string(),
            processing_parameters,
            approved_for_ml,
        };

        let _: Lineage = client.insert("data_lineage", &lineage).await?;
        Ok(())
    }
}

impl From<DataStoreError> for crate::error::OrchestratorError {
    fn from(e: DataStoreError) -> Self {
        crate::error::OrchestratorError::DataStore(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_emitter_is_a_silent_no_op() {
        let emitter = LoggingEmitter::new(None).unwrap();
        let job = crate::core::Job {
            job_id: "water_20260728_120000_deadbeef".to_string(),
            molecule_name: "water".to_string(),
            xyz_content: String::new(),
            optimization_level: crate::core::OptimizationLevel::Normal,
            email: None,
            tags: Default::default(),
            charge: 0,
            multiplicity: 1,
            status: crate::core::JobStatus::Completed,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            error_message: None,
            results: None,
            cancel_requested: false,
        };
        let result = ParsedResult {
            energy: Some(-10.0),
            ..Default::default()
        };
        let mut sample = crate::quality::RollingSample::new(8);
        let assessment = crate::quality::assess(&result, &mut sample, "calculations", 1);
        // Must not panic or block: no client is constructed in no-op mode.
        emitter.emit_all(&job, &result, &assessment, 1.0).await;
    }
}
