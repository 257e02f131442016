//! Compiler: `JobDef` + ctx + payload -> `JobInstance`.
//!
//! Each step is compiled in declared order. The instance always has exactly
//! as many steps as the definition; an `if` that evaluates false only flips
//! `compiled_skip`. `@run.*` references in params are kept for the executor.

use chrono::Utc;
use jobflow_types::job::{JobDef, JobInstance, JobStepInstance, StepDef};
use serde_json::{Map, Value};
use thiserror::Error;

use super::condition::{ConditionError, evaluate_condition, mentions_run_reference};
use super::definition::{StructureError, check_structure};
use super::hash::compute_hash;
use super::reference::{ReferenceError, resolve_compile_time};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid job definition: {0}")]
    Structure(#[from] StructureError),

    #[error("step '{step_id}': condition '{condition}' references run-time output")]
    RunReferenceInCondition { step_id: String, condition: String },

    #[error("step '{step_id}': condition '{condition}' failed: {source}")]
    Condition {
        step_id: String,
        condition: String,
        source: ConditionError,
    },

    #[error("step '{step_id}': {source}")]
    Reference {
        step_id: String,
        source: ReferenceError,
    },

    #[error("cannot hash job definition: {0}")]
    Hash(#[from] serde_json::Error),
}

impl CompileError {
    /// The step the error belongs to, when it is step-scoped.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            CompileError::RunReferenceInCondition { step_id, .. }
            | CompileError::Condition { step_id, .. }
            | CompileError::Reference { step_id, .. } => Some(step_id),
            CompileError::Structure(_) | CompileError::Hash(_) => None,
        }
    }
}

/// Compile a job definition against a caller context and invocation payload.
///
/// `job_def_sha256` is computed over the source definition, so compilations
/// with different ctx/payload share a content address.
#[tracing::instrument(skip_all, fields(job_id = %job_def.job_id, version = %job_def.version))]
pub fn compile(
    job_def: &JobDef,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<JobInstance, CompileError> {
    check_structure(job_def)?;
    let job_def_sha256 = compute_hash(job_def)?;

    let steps = job_def
        .steps
        .iter()
        .map(|step| compile_step(step, ctx, payload))
        .collect::<Result<Vec<_>, _>>()?;

    let skipped = steps.iter().filter(|s| s.compiled_skip).count();
    tracing::debug!(steps = steps.len(), skipped, sha = %job_def_sha256, "compiled job");

    Ok(JobInstance {
        job_id: job_def.job_id.clone(),
        job_version: job_def.version.clone(),
        job_def_sha256,
        compiled_at: Utc::now(),
        steps,
    })
}

fn compile_step(
    step: &StepDef,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<JobStepInstance, CompileError> {
    let compiled_skip = match &step.if_ {
        Some(condition) => !evaluate_step_condition(step, condition, ctx, payload)?,
        None => false,
    };

    let params = resolve_compile_time(&step.params, ctx, payload, true).map_err(|source| {
        CompileError::Reference {
            step_id: step.step_id.clone(),
            source,
        }
    })?;

    Ok(JobStepInstance {
        step_id: step.step_id.clone(),
        op: step.op,
        params,
        phase_id: step.phase_id.clone(),
        timeout_s: step.timeout_s,
        continue_on_error: step.continue_on_error,
        idempotency: step.idempotency.clone(),
        compiled_skip,
    })
}

fn evaluate_step_condition(
    step: &StepDef,
    condition: &str,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<bool, CompileError> {
    if mentions_run_reference(condition) {
        return Err(CompileError::RunReferenceInCondition {
            step_id: step.step_id.clone(),
            condition: condition.to_string(),
        });
    }
    evaluate_condition(condition, ctx, payload).map_err(|source| CompileError::Condition {
        step_id: step.step_id.clone(),
        condition: condition.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
