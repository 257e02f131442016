//! In-memory `RunStore` for tests, dry runs and embedding.
//!
//! Every map is a `DashMap`, so independent runs can be written concurrently
//! without a global lock.

use dashmap::DashMap;
use jobflow_types::error::RepositoryError;
use jobflow_types::run::{AttemptRecord, RunRecord, StepManifest};
use serde_json::Value;

use super::run_store::{RunStore, manifest_ref, new_run_id, output_ref};

/// Run store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: DashMap<String, RunRecord>,
    manifests: DashMap<(String, String), StepManifest>,
    outputs: DashMap<(String, String), Value>,
    attempts: DashMap<(String, u32), AttemptRecord>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored manifests across all runs.
    pub fn manifest_count(&self) -> usize {
        self.manifests.len()
    }
}

impl RunStore for MemoryRunStore {
    async fn create_run(
        &self,
        job_id: &str,
        job_def_sha256: &str,
        envelope: &Value,
    ) -> Result<RunRecord, RepositoryError> {
        let run = RunRecord::start(new_run_id(), job_id, job_def_sha256, envelope.clone());
        if self.runs.contains_key(&run.run_id) {
            return Err(RepositoryError::Conflict(format!(
                "run '{}' already exists",
                run.run_id
            )));
        }
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        match self.runs.get_mut(&run.run_id) {
            Some(mut existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    async fn store_manifest(&self, manifest: &StepManifest) -> Result<String, RepositoryError> {
        self.manifests.insert(
            (manifest.run_id.clone(), manifest.step_id.clone()),
            manifest.clone(),
        );
        Ok(manifest_ref(&manifest.run_id, &manifest.step_id))
    }

    async fn get_manifest(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepManifest>, RepositoryError> {
        Ok(self
            .manifests
            .get(&(run_id.to_string(), step_id.to_string()))
            .map(|m| m.clone()))
    }

    async fn store_output(
        &self,
        run_id: &str,
        step_id: &str,
        output: &Value,
    ) -> Result<String, RepositoryError> {
        self.outputs
            .insert((run_id.to_string(), step_id.to_string()), output.clone());
        Ok(output_ref(run_id, step_id))
    }

    async fn get_output(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        Ok(self
            .outputs
            .get(&(run_id.to_string(), step_id.to_string()))
            .map(|o| o.clone()))
    }

    async fn store_attempt(&self, attempt: &AttemptRecord) -> Result<(), RepositoryError> {
        self.attempts.insert(
            (attempt.run_id.clone(), attempt.attempt_n),
            attempt.clone(),
        );
        Ok(())
    }

    async fn get_attempt(
        &self,
        run_id: &str,
        attempt_n: u32,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        Ok(self
            .attempts
            .get(&(run_id.to_string(), attempt_n))
            .map(|a| a.clone()))
    }

    async fn get_latest_attempt(
        &self,
        run_id: &str,
    ) -> Result<Option<AttemptRecord>, RepositoryError> {
        Ok(self
            .attempts
            .iter()
            .filter(|a| a.key().0 == run_id)
            .max_by_key(|a| a.key().1)
            .map(|a| a.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
