//! Execution tracking types: run records, step manifests, attempts and
//! per-step outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{Backend, Op};

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Overall status of a run. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Top-level record of one `execute()` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// ULID: 26 characters, lexicographically time-sortable.
    pub run_id: String,
    pub job_id: String,
    pub job_def_sha256: String,
    /// Runtime context supplied at invocation.
    pub envelope: Value,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RunRecord {
    /// A freshly started run.
    pub fn start(
        run_id: impl Into<String>,
        job_id: impl Into<String>,
        job_def_sha256: impl Into<String>,
        envelope: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job_id: job_id.into(),
            job_def_sha256: job_def_sha256.into(),
            envelope,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            duration_ms: 0,
            rows_read: 0,
            rows_written: 0,
            errors: Vec::new(),
        }
    }

    /// Move the run to a terminal status, stamping completion time and duration.
    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }
}

// ---------------------------------------------------------------------------
// Step manifest
// ---------------------------------------------------------------------------

/// The dispatchable, replay-safe description of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub run_id: String,
    pub step_id: String,
    /// Always equal to `op.backend()`.
    pub backend: Backend,
    pub op: Op,
    /// Fully resolved: no `@ctx.*`, `@payload.*` or `@run.*` references remain.
    pub resolved_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    pub idempotency_key: String,
    #[serde(default = "default_manifest_timeout")]
    pub timeout_s: u64,
}

fn default_manifest_timeout() -> u64 {
    crate::job::DEFAULT_STEP_TIMEOUT_S
}

impl StepManifest {
    /// Whether the declared backend agrees with the one derived from `op`.
    pub fn backend_matches_op(&self) -> bool {
        self.backend == self.op.backend()
    }
}

// ---------------------------------------------------------------------------
// Step outcomes
// ---------------------------------------------------------------------------

/// Status of one step within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Structured error attached to a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorInfo {
    /// Machine-readable error kind (e.g. `timeout`, `missing_handler`).
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl StepErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Present only when `status` is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorInfo>,
}

impl StepOutcome {
    fn bare(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            started_at: None,
            completed_at: None,
            manifest_ref: None,
            output_ref: None,
            error: None,
        }
    }

    pub fn pending(step_id: impl Into<String>) -> Self {
        Self::bare(step_id, StepStatus::Pending)
    }

    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self::bare(step_id, StepStatus::Skipped)
    }

    pub fn running(step_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..Self::bare(step_id, StepStatus::Running)
        }
    }

    /// Transition a running outcome to completed.
    pub fn complete(mut self, manifest_ref: String, output_ref: String) -> Self {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.manifest_ref = Some(manifest_ref);
        self.output_ref = Some(output_ref);
        self.error = None;
        self
    }

    /// Transition a running outcome to failed.
    ///
    /// `manifest_ref` is absent when the step failed before its manifest was stored.
    pub fn fail(mut self, manifest_ref: Option<String>, error: StepErrorInfo) -> Self {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.manifest_ref = manifest_ref;
        self.output_ref = None;
        self.error = Some(error);
        self
    }

    /// Check the timestamp/error presence rules for the current status.
    pub fn validate(&self) -> Result<(), String> {
        let started = self.started_at.is_some();
        let completed = self.completed_at.is_some();
        let ok = match self.status {
            StepStatus::Pending => !started && !completed,
            StepStatus::Running => started && !completed,
            StepStatus::Completed | StepStatus::Failed => started && completed,
            StepStatus::Skipped => true,
        };
        if !ok {
            return Err(format!(
                "step '{}' has inconsistent timestamps for status {:?}",
                self.step_id, self.status
            ));
        }
        if self.error.is_some() != (self.status == StepStatus::Failed) {
            return Err(format!(
                "step '{}': error must be present iff status is failed",
                self.step_id
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
}

/// One retry attempt's worth of step outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub run_id: String,
    /// 1-based.
    pub attempt_n: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub step_outcomes: Vec<StepOutcome>,
}

impl AttemptRecord {
    pub fn start(run_id: impl Into<String>, attempt_n: u32) -> Self {
        Self {
            run_id: run_id.into(),
            attempt_n,
            started_at: Utc::now(),
            completed_at: None,
            status: AttemptStatus::Running,
            step_outcomes: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: AttemptStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Step ids whose outcome is failed, in execution order.
    pub fn failed_step_ids(&self) -> Vec<String> {
        self.step_outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Failed)
            .map(|o| o.step_id.clone())
            .collect()
    }

    /// Whether any step failed, including continue-on-error failures.
    pub fn had_failure(&self) -> bool {
        self.step_outcomes
            .iter()
            .any(|o| o.status == StepStatus::Failed)
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.step_outcomes.iter().find(|o| o.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
