//! Building, validating and hashing step manifests.

use jobflow_types::job::{Backend, JobStepInstance, Op};
use jobflow_types::run::StepManifest;
use serde_json::{Map, Value};
use thiserror::Error;

use super::hash::{canonical_json_of, sha256_hex};
use super::reference::find_reference;

/// Resolved param whose SHA-256 becomes `prompt_hash` for llm ops.
pub const PROMPT_PARAM: &str = "prompt";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error(
        "step '{step_id}': backend '{declared}' does not match op '{op}' (expected '{expected}')"
    )]
    BackendMismatch {
        step_id: String,
        op: Op,
        declared: Backend,
        expected: Backend,
    },

    #[error("step '{step_id}': unresolved reference '{reference}' in params")]
    UnresolvedReference { step_id: String, reference: String },
}

/// SHA-256 of the `prompt` param for llm-backend ops, if it is a string.
pub fn prompt_hash(op: Op, resolved_params: &Map<String, Value>) -> Option<String> {
    if op.backend() != Backend::Llm {
        return None;
    }
    resolved_params
        .get(PROMPT_PARAM)
        .and_then(Value::as_str)
        .map(sha256_hex)
}

/// Build and validate the manifest for one step execution.
pub fn build_manifest(
    run_id: &str,
    step: &JobStepInstance,
    resolved_params: Map<String, Value>,
    idempotency_key: String,
) -> Result<StepManifest, ManifestError> {
    let manifest = StepManifest {
        run_id: run_id.to_string(),
        step_id: step.step_id.clone(),
        backend: step.op.backend(),
        op: step.op,
        prompt_hash: prompt_hash(step.op, &resolved_params),
        resolved_params,
        idempotency_key,
        timeout_s: step.timeout_s,
    };
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Reject a backend that disagrees with the op, or any leftover reference.
pub fn validate_manifest(manifest: &StepManifest) -> Result<(), ManifestError> {
    if !manifest.backend_matches_op() {
        return Err(ManifestError::BackendMismatch {
            step_id: manifest.step_id.clone(),
            op: manifest.op,
            declared: manifest.backend,
            expected: manifest.op.backend(),
        });
    }
    for value in manifest.resolved_params.values() {
        if let Some(reference) = find_reference(value) {
            return Err(ManifestError::UnresolvedReference {
                step_id: manifest.step_id.clone(),
                reference: reference.to_string(),
            });
        }
    }
    Ok(())
}

/// Canonical-JSON SHA-256 of a manifest.
pub fn manifest_sha256(manifest: &StepManifest) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json_of(manifest)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
