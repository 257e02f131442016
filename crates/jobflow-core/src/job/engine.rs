//! Engine facade: load -> compile -> execute, plus run introspection.
//!
//! Load and compile failures are returned as errors and never retried: they
//! indicate a definition problem. Step failures come back inside a successful
//! `ExecutionResult` so batch callers can inspect `success` uniformly.

use std::sync::Arc;

use jobflow_types::job::JobInstance;
use jobflow_types::run::{AttemptRecord, RunRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::compiler::{CompileError, compile};
use super::definition::RegistryError;
use super::executor::{ExecutionResult, ExecutorError, JobExecutor};
use super::hash::compute_hash;
use super::registry::JobSource;
use crate::repository::run_store::RunStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("cannot hash job definition: {0}")]
    Hash(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One invocation of a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    pub job_id: String,
    /// `None` or `"latest"` for the current definition.
    pub version: Option<String>,
    pub ctx: Map<String, Value>,
    pub payload: Map<String, Value>,
    /// Extra envelope entries stored on the run and visible as `@run.envelope.*`.
    pub envelope: Map<String, Value>,
}

impl ExecutionRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn ctx(mut self, ctx: Map<String, Value>) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn envelope_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.envelope.insert(key.into(), value);
        self
    }

    /// The run envelope: extra entries plus `job_id`, `ctx` and `payload`.
    ///
    /// The three core keys win over extra entries of the same name.
    pub fn to_envelope(&self) -> Value {
        let mut envelope = self.envelope.clone();
        envelope.insert("job_id".to_string(), Value::String(self.job_id.clone()));
        envelope.insert("ctx".to_string(), Value::Object(self.ctx.clone()));
        envelope.insert("payload".to_string(), Value::Object(self.payload.clone()));
        Value::Object(envelope)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A run and its most recent attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatusReport {
    pub run: RunRecord,
    pub latest_attempt: Option<AttemptRecord>,
}

/// Whether a run's recorded definition hash matches the current definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunVerification {
    pub run_id: String,
    pub job_id: String,
    pub recorded_sha256: String,
    pub current_sha256: String,
    pub matches: bool,
}

// ---------------------------------------------------------------------------
// JobEngine
// ---------------------------------------------------------------------------

pub struct JobEngine<S: RunStore> {
    source: Arc<dyn JobSource>,
    executor: JobExecutor<S>,
}

impl<S: RunStore> JobEngine<S> {
    pub fn new(source: Arc<dyn JobSource>, executor: JobExecutor<S>) -> Self {
        Self { source, executor }
    }

    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    pub fn executor(&self) -> &JobExecutor<S> {
        &self.executor
    }

    /// Load and compile without executing.
    pub fn compile(&self, request: &ExecutionRequest) -> Result<JobInstance, EngineError> {
        let def = self
            .source
            .load(&request.job_id, request.version.as_deref())?;
        Ok(compile(&def, &request.ctx, &request.payload)?)
    }

    /// Load, compile and execute a job.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let instance = self.compile(&request)?;
        let result = self
            .executor
            .execute(&instance, request.to_envelope())
            .await?;
        Ok(result)
    }

    /// The run record and its latest attempt.
    pub async fn status(&self, run_id: &str) -> Result<RunStatusReport, EngineError> {
        let store = self.executor.store();
        let run = store
            .get_run(run_id)
            .await
            .map_err(ExecutorError::from)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let latest_attempt = store
            .get_latest_attempt(run_id)
            .await
            .map_err(ExecutorError::from)?;
        Ok(RunStatusReport {
            run,
            latest_attempt,
        })
    }

    /// Re-hash the current definition of a run's job and compare it with the
    /// hash recorded when the run started.
    pub async fn verify_run(&self, run_id: &str) -> Result<RunVerification, EngineError> {
        let run = self
            .executor
            .store()
            .get_run(run_id)
            .await
            .map_err(ExecutorError::from)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let def = self.source.load(&run.job_id, None)?;
        let current_sha256 = compute_hash(&def)?;
        let matches = current_sha256 == run.job_def_sha256;
        if !matches {
            tracing::warn!(
                run_id,
                job_id = %run.job_id,
                recorded = %run.job_def_sha256,
                current = %current_sha256,
                "job definition changed since run"
            );
        }
        Ok(RunVerification {
            run_id: run.run_id,
            job_id: run.job_id,
            recorded_sha256: run.job_def_sha256,
            current_sha256,
            matches,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
