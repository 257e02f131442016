//! Job executor: attempt loop and per-step execution.
//!
//! One `execute()` call creates exactly one `RunRecord` and runs up to
//! `max_attempts` attempts. Each attempt walks the compiled steps in order:
//!
//! 1. compiled-skip steps get a `skipped` outcome and are never dispatched
//! 2. `@run.*` references resolve against this attempt's prior outputs plus
//!    the synthetic `envelope` entry
//! 3. the idempotency key is derived and the manifest built and stored
//! 4. the manifest is dispatched (under a hard timeout when enabled)
//! 5. the output is stored and the outcome recorded
//!
//! A failed step either stops the attempt or, with `continue_on_error`, is
//! recorded and skipped over. A stopped attempt is retried as a whole while
//! attempts remain. Step failures are data; only run-store failures abort
//! `execute` with an error.

use std::time::Duration;

use chrono::Utc;
use jobflow_types::error::RepositoryError;
use jobflow_types::job::{JobInstance, JobStepInstance};
use jobflow_types::run::{
    AttemptRecord, AttemptStatus, RunRecord, RunStatus, StepErrorInfo, StepManifest, StepOutcome,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::definition::ENVELOPE_STEP_ID;
use super::dispatch::{DispatchError, HandlerRegistry};
use super::handler::HandlerResult;
use super::idempotency::{IdempotencyError, derive_idempotency_key};
use super::manifest::{ManifestError, build_manifest, validate_manifest};
use super::reference::{ReferenceError, resolve_run_time};
use crate::repository::run_store::RunStore;

/// Default number of attempts per run (no retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Handler result fields summed into the run record.
const ROWS_READ_FIELD: &str = "rows_read";
const ROWS_WRITTEN_FIELD: &str = "rows_written";

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Total attempts per run. Zero is treated as one.
    pub max_attempts: u32,
    /// Abort dispatch after the step's `timeout_s`.
    pub enforce_timeouts: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enforce_timeouts: true,
        }
    }
}

impl ExecutorConfig {
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Outcome of one `execute()` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub run_id: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// Failed step ids of the final attempt, including continue-on-error failures.
    pub failed_steps: Vec<String>,
    /// Why the run failed. The message names the step that stopped the final attempt.
    pub error: Option<String>,
    /// Outputs of the steps that completed in the final attempt.
    pub outputs: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Host-level failures that abort execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("run store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("no manifest for step '{step_id}' in run '{run_id}'")]
    ManifestNotFound { run_id: String, step_id: String },

    #[error(transparent)]
    Step(#[from] StepExecutionError),
}

/// A step-level failure. Recorded on the step outcome, never thrown from `execute`.
#[derive(Debug, Error)]
pub enum StepExecutionError {
    #[error("step '{step_id}': {source}")]
    Reference {
        step_id: String,
        source: ReferenceError,
    },

    #[error("step '{step_id}': {source}")]
    Idempotency {
        step_id: String,
        source: IdempotencyError,
    },

    #[error("{source}")]
    Manifest {
        step_id: String,
        source: ManifestError,
    },

    #[error("step '{step_id}': {source}")]
    Dispatch {
        step_id: String,
        source: DispatchError,
    },

    #[error("step '{step_id}' timed out after {timeout_s}s")]
    Timeout { step_id: String, timeout_s: u64 },
}

impl StepExecutionError {
    /// Machine-readable kind, stored as `StepErrorInfo::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            StepExecutionError::Reference { .. } => "reference_error",
            StepExecutionError::Idempotency { .. } => "idempotency_error",
            StepExecutionError::Manifest { .. } => "manifest_error",
            StepExecutionError::Dispatch {
                source: DispatchError::MissingHandler { .. },
                ..
            } => "missing_handler",
            StepExecutionError::Dispatch { .. } => "handler_error",
            StepExecutionError::Timeout { .. } => "timeout",
        }
    }

    pub fn step_id(&self) -> &str {
        match self {
            StepExecutionError::Reference { step_id, .. }
            | StepExecutionError::Idempotency { step_id, .. }
            | StepExecutionError::Manifest { step_id, .. }
            | StepExecutionError::Dispatch { step_id, .. }
            | StepExecutionError::Timeout { step_id, .. } => step_id,
        }
    }

    fn to_info(&self) -> StepErrorInfo {
        StepErrorInfo::new(self.kind(), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AttemptStats {
    outputs: Map<String, Value>,
    rows_read: u64,
    rows_written: u64,
    /// `(step_id, message)` for every failed step, in order.
    failures: Vec<(String, String)>,
}

impl AttemptStats {
    fn record_output(&mut self, step_id: &str, output: &HandlerResult) {
        let count = |field: &str| output.get(field).and_then(Value::as_u64).unwrap_or(0);
        self.rows_read = self.rows_read.saturating_add(count(ROWS_READ_FIELD));
        self.rows_written = self.rows_written.saturating_add(count(ROWS_WRITTEN_FIELD));
        self.outputs
            .insert(step_id.to_string(), Value::Object(output.clone()));
    }

    fn failed_steps(&self) -> Vec<String> {
        self.failures.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// An attempt that ran to the end (possibly with continue-on-error failures).
#[derive(Debug)]
struct AttemptSuccess {
    stats: AttemptStats,
}

/// An attempt stopped by a step that does not continue on error.
#[derive(Debug)]
struct AttemptFailure {
    stats: AttemptStats,
    step_id: String,
    message: String,
}

/// A completed step.
struct StepSuccess {
    manifest_ref: String,
    output_ref: String,
    output: HandlerResult,
}

/// A failed step, with its manifest reference if the manifest was stored.
struct StepFailure {
    manifest_ref: Option<String>,
    error: StepExecutionError,
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

/// Runs compiled job instances against a run store and handler registry.
///
/// Generic over `S: RunStore` for storage flexibility.
pub struct JobExecutor<S: RunStore> {
    store: S,
    handlers: HandlerRegistry,
    config: ExecutorConfig,
}

impl<S: RunStore> JobExecutor<S> {
    pub fn new(store: S, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            handlers,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a compiled instance.
    ///
    /// `envelope` is stored on the run record and exposed to steps as
    /// `@run.envelope.*`.
    pub async fn execute(
        &self,
        instance: &JobInstance,
        envelope: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let mut run = self
            .store
            .create_run(&instance.job_id, &instance.job_def_sha256, &envelope)
            .await?;
        let max_attempts = self.config.attempts();

        tracing::info!(
            run_id = %run.run_id,
            job_id = %instance.job_id,
            version = %instance.job_version,
            steps = instance.steps.len(),
            max_attempts,
            "starting job run"
        );

        let mut attempt_n = 1;
        loop {
            let result = match self
                .run_attempt(&run.run_id, instance, &envelope, attempt_n)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    self.abandon_run(&mut run, attempt_n, &e).await;
                    return Err(e);
                }
            };

            match result {
                Ok(success) => {
                    let stats = success.stats;
                    record_failures(&mut run, attempt_n, &stats);
                    self.finish_run(&mut run, RunStatus::Success, &stats).await?;
                    tracing::info!(
                        run_id = %run.run_id,
                        attempt = attempt_n,
                        duration_ms = run.duration_ms,
                        "job run succeeded"
                    );
                    return Ok(ExecutionResult {
                        success: true,
                        run_id: run.run_id,
                        attempts: attempt_n,
                        failed_steps: stats.failed_steps(),
                        error: None,
                        outputs: stats.outputs,
                    });
                }
                Err(failure) => {
                    record_failures(&mut run, attempt_n, &failure.stats);
                    if attempt_n < max_attempts {
                        tracing::warn!(
                            run_id = %run.run_id,
                            attempt = attempt_n,
                            step_id = %failure.step_id,
                            error = %failure.message,
                            "attempt failed, retrying"
                        );
                        attempt_n += 1;
                        continue;
                    }

                    self.finish_run(&mut run, RunStatus::Failed, &failure.stats)
                        .await?;
                    tracing::info!(
                        run_id = %run.run_id,
                        attempts = attempt_n,
                        step_id = %failure.step_id,
                        "job run failed"
                    );
                    return Ok(ExecutionResult {
                        success: false,
                        run_id: run.run_id,
                        attempts: attempt_n,
                        failed_steps: failure.stats.failed_steps(),
                        error: Some(failure.message),
                        outputs: failure.stats.outputs,
                    });
                }
            }
        }
    }

    /// Re-dispatch a persisted manifest unchanged, with its original idempotency key.
    ///
    /// The replayed output is returned, not stored.
    pub async fn replay_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<HandlerResult, ExecutorError> {
        let manifest = self
            .store
            .get_manifest(run_id, step_id)
            .await?
            .ok_or_else(|| ExecutorError::ManifestNotFound {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        validate_manifest(&manifest).map_err(|source| StepExecutionError::Manifest {
            step_id: step_id.to_string(),
            source,
        })?;
        tracing::info!(
            run_id,
            step_id,
            idempotency_key = %manifest.idempotency_key,
            "replaying step"
        );
        Ok(self.dispatch(&manifest).await?)
    }

    /// Best-effort terminal state for a run aborted by a store failure.
    async fn abandon_run(&self, run: &mut RunRecord, attempt_n: u32, error: &ExecutorError) {
        run.errors.push(format!("attempt {attempt_n}: {error}"));
        run.finish(RunStatus::Failed);
        if let Err(e) = self.store.update_run(run).await {
            tracing::warn!(run_id = %run.run_id, error = %e, "could not record aborted run");
        }
        tracing::info!(
            run_id = %run.run_id,
            attempt = attempt_n,
            error = %error,
            "job run aborted"
        );
    }

    async fn finish_run(
        &self,
        run: &mut RunRecord,
        status: RunStatus,
        stats: &AttemptStats,
    ) -> Result<(), ExecutorError> {
        run.rows_read = stats.rows_read;
        run.rows_written = stats.rows_written;
        run.finish(status);
        self.store.update_run(run).await?;
        Ok(())
    }

    /// Run one attempt. The outer error is a store failure; the inner result
    /// says whether the attempt ran to the end.
    async fn run_attempt(
        &self,
        run_id: &str,
        instance: &JobInstance,
        envelope: &Value,
        attempt_n: u32,
    ) -> Result<Result<AttemptSuccess, AttemptFailure>, ExecutorError> {
        let mut attempt = AttemptRecord::start(run_id, attempt_n);
        self.store.store_attempt(&attempt).await?;

        // Lookup scope for @run.* references: prior outputs plus the envelope.
        let mut scope = Map::new();
        scope.insert(ENVELOPE_STEP_ID.to_string(), envelope.clone());
        let mut stats = AttemptStats::default();
        let mut stopped_by: Option<(String, String)> = None;

        for step in &instance.steps {
            if step.compiled_skip {
                tracing::debug!(run_id, step_id = %step.step_id, "step skipped at compile time");
                attempt.step_outcomes.push(StepOutcome::skipped(&step.step_id));
                continue;
            }

            let running = StepOutcome::running(&step.step_id, Utc::now());
            tracing::debug!(
                run_id,
                attempt = attempt_n,
                step_id = %step.step_id,
                op = %step.op,
                "step started"
            );

            let step_result = match self.run_step(run_id, step, &scope).await {
                Ok(step_result) => step_result,
                Err(e) => {
                    let info = StepErrorInfo::new("store_error", e.to_string());
                    attempt.step_outcomes.push(running.fail(None, info));
                    attempt.finish(AttemptStatus::Failed);
                    if let Err(store_err) = self.store.store_attempt(&attempt).await {
                        tracing::warn!(
                            run_id,
                            attempt = attempt_n,
                            error = %store_err,
                            "could not record aborted attempt"
                        );
                    }
                    return Err(e);
                }
            };

            match step_result {
                Ok(done) => {
                    stats.record_output(&step.step_id, &done.output);
                    scope.insert(step.step_id.clone(), Value::Object(done.output));
                    attempt
                        .step_outcomes
                        .push(running.complete(done.manifest_ref, done.output_ref));
                    tracing::debug!(run_id, step_id = %step.step_id, "step completed");
                }
                Err(failed) => {
                    let message = failed.error.to_string();
                    attempt
                        .step_outcomes
                        .push(running.fail(failed.manifest_ref, failed.error.to_info()));
                    stats.failures.push((step.step_id.clone(), message.clone()));

                    if step.continue_on_error {
                        tracing::warn!(
                            run_id,
                            step_id = %step.step_id,
                            kind = failed.error.kind(),
                            error = %message,
                            "step failed, continuing"
                        );
                        continue;
                    }
                    stopped_by = Some((step.step_id.clone(), message));
                    break;
                }
            }
        }

        let status = if stopped_by.is_some() {
            AttemptStatus::Failed
        } else {
            AttemptStatus::Completed
        };
        attempt.finish(status);
        self.store.store_attempt(&attempt).await?;
        tracing::debug!(run_id, attempt = attempt_n, ?status, "attempt finished");

        Ok(match stopped_by {
            None => Ok(AttemptSuccess { stats }),
            Some((step_id, message)) => Err(AttemptFailure {
                stats,
                step_id,
                message,
            }),
        })
    }

    /// Resolve, key, persist, dispatch and store one step.
    async fn run_step(
        &self,
        run_id: &str,
        step: &JobStepInstance,
        scope: &Map<String, Value>,
    ) -> Result<Result<StepSuccess, StepFailure>, ExecutorError> {
        let manifest = match prepare_manifest(run_id, step, scope) {
            Ok(manifest) => manifest,
            Err(error) => {
                return Ok(Err(StepFailure {
                    manifest_ref: None,
                    error,
                }));
            }
        };
        let manifest_ref = self.store.store_manifest(&manifest).await?;

        let output = match self.dispatch(&manifest).await {
            Ok(output) => output,
            Err(error) => {
                return Ok(Err(StepFailure {
                    manifest_ref: Some(manifest_ref),
                    error,
                }));
            }
        };

        let output_ref = self
            .store
            .store_output(run_id, &step.step_id, &Value::Object(output.clone()))
            .await?;
        Ok(Ok(StepSuccess {
            manifest_ref,
            output_ref,
            output,
        }))
    }

    async fn dispatch(&self, manifest: &StepManifest) -> Result<HandlerResult, StepExecutionError> {
        let dispatched = self.handlers.dispatch(manifest);
        let result = if self.config.enforce_timeouts {
            let limit = Duration::from_secs(manifest.timeout_s);
            match tokio::time::timeout(limit, dispatched).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(StepExecutionError::Timeout {
                        step_id: manifest.step_id.clone(),
                        timeout_s: manifest.timeout_s,
                    });
                }
            }
        } else {
            dispatched.await
        };
        result.map_err(|source| StepExecutionError::Dispatch {
            step_id: manifest.step_id.clone(),
            source,
        })
    }
}

/// Resolve run-time references, derive the idempotency key and build the manifest.
fn prepare_manifest(
    run_id: &str,
    step: &JobStepInstance,
    scope: &Map<String, Value>,
) -> Result<StepManifest, StepExecutionError> {
    let step_id = || step.step_id.clone();
    let resolved = resolve_run_time(&step.params, scope).map_err(|source| {
        StepExecutionError::Reference {
            step_id: step_id(),
            source,
        }
    })?;
    let idempotency = step.effective_idempotency();
    let key = derive_idempotency_key(run_id, &step.step_id, &resolved, &idempotency)
        .map_err(|source| StepExecutionError::Idempotency {
            step_id: step_id(),
            source,
        })?;
    build_manifest(run_id, step, resolved, key).map_err(|source| StepExecutionError::Manifest {
        step_id: step_id(),
        source,
    })
}

fn record_failures(run: &mut RunRecord, attempt_n: u32, stats: &AttemptStats) {
    for (_, message) in &stats.failures {
        run.errors.push(format!("attempt {attempt_n}: {message}"));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
