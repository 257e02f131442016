//! Run store trait definition.
//!
//! Defines the persistence interface for run records, step manifests, step
//! outputs and attempt records. `MemoryRunStore` (this crate) and
//! `FileRunStore` (jobflow-infra) implement it.
//!
//! Writes must be visible to subsequent reads as soon as the returned future
//! resolves: the executor resolves `@run.*` references from state written by
//! the previous step.

use std::future::Future;
use std::sync::Arc;

use jobflow_types::error::RepositoryError;
use jobflow_types::run::{AttemptRecord, RunRecord, StepManifest};
use serde_json::Value;

/// Generate a new run id: a 26-character ULID (48-bit ms timestamp + 80 random bits).
pub fn new_run_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Reference string for a stored manifest, matching the file store layout.
pub fn manifest_ref(run_id: &str, step_id: &str) -> String {
    format!("manifests/{run_id}/{step_id}.json")
}

/// Reference string for a stored step output, matching the file store layout.
pub fn output_ref(run_id: &str, step_id: &str) -> String {
    format!("outputs/{run_id}/{step_id}.json")
}

/// Repository trait for run persistence.
///
/// Covers four entity families keyed by `run_id`:
/// - **Runs:** one `RunRecord` per `execute()` call.
/// - **Manifests:** one `StepManifest` per executed step.
/// - **Outputs:** the result mapping of each completed step.
/// - **Attempts:** one `AttemptRecord` per retry attempt.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create and persist a new running `RunRecord`, assigning its `run_id`.
    fn create_run(
        &self,
        job_id: &str,
        job_def_sha256: &str,
        envelope: &Value,
    ) -> impl Future<Output = Result<RunRecord, RepositoryError>> + Send;

    /// Replace a run record (status, counters, errors).
    fn update_run(
        &self,
        run: &RunRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// List runs of a job, oldest first.
    fn list_runs(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    /// Persist a manifest, returning its reference. Later attempts overwrite.
    fn store_manifest(
        &self,
        manifest: &StepManifest,
    ) -> impl Future<Output = Result<String, RepositoryError>> + Send;

    fn get_manifest(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<StepManifest>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Persist a step output, returning its reference. Later attempts overwrite.
    fn store_output(
        &self,
        run_id: &str,
        step_id: &str,
        output: &Value,
    ) -> impl Future<Output = Result<String, RepositoryError>> + Send;

    fn get_output(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Insert or replace an attempt keyed by `(run_id, attempt_n)`.
    fn store_attempt(
        &self,
        attempt: &AttemptRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_attempt(
        &self,
        run_id: &str,
        attempt_n: u32,
    ) -> impl Future<Output = Result<Option<AttemptRecord>, RepositoryError>> + Send;

    /// The attempt with the highest `attempt_n` for a run.
    fn get_latest_attempt(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<AttemptRecord>, RepositoryError>> + Send;
}

/// Shared stores: lets a caller keep a handle to the store it gave the executor.
impl<T: RunStore> RunStore for Arc<T> {
    fn create_run(
        &self,
        job_id: &str,
        job_def_sha256: &str,
        envelope: &Value,
    ) -> impl Future<Output = Result<RunRecord, RepositoryError>> + Send {
        (**self).create_run(job_id, job_def_sha256, envelope)
    }

    fn update_run(
        &self,
        run: &RunRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).update_run(run)
    }

    fn get_run(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send {
        (**self).get_run(run_id)
    }

    fn list_runs(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send {
        (**self).list_runs(job_id)
    }

    fn store_manifest(
        &self,
        manifest: &StepManifest,
    ) -> impl Future<Output = Result<String, RepositoryError>> + Send {
        (**self).store_manifest(manifest)
    }

    fn get_manifest(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<StepManifest>, RepositoryError>> + Send {
        (**self).get_manifest(run_id, step_id)
    }

    fn store_output(
        &self,
        run_id: &str,
        step_id: &str,
        output: &Value,
    ) -> impl Future<Output = Result<String, RepositoryError>> + Send {
        (**self).store_output(run_id, step_id, output)
    }

    fn get_output(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send {
        (**self).get_output(run_id, step_id)
    }

    fn store_attempt(
        &self,
        attempt: &AttemptRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).store_attempt(attempt)
    }

    fn get_attempt(
        &self,
        run_id: &str,
        attempt_n: u32,
    ) -> impl Future<Output = Result<Option<AttemptRecord>, RepositoryError>> + Send {
        (**self).get_attempt(run_id, attempt_n)
    }

    fn get_latest_attempt(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<AttemptRecord>, RepositoryError>> + Send {
        (**self).get_latest_attempt(run_id)
    }
}
