//! Job domain types for jobflow.
//!
//! A `JobDef` is the declarative, version-controlled source of a job. The
//! compiler turns it into a `JobInstance`: the same steps in the same order,
//! with compile-time references resolved and `if` conditions folded into
//! per-step `compiled_skip` flags.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_S: u64 = 300;

// ---------------------------------------------------------------------------
// Operation taxonomy
// ---------------------------------------------------------------------------

/// The execution domain a step's operation belongs to.
///
/// Manifests are routed to handlers by backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Storage,
    Compute,
    Llm,
    Callable,
    Orchestration,
}

impl Backend {
    /// Every backend, in declaration order.
    pub const ALL: [Backend; 5] = [
        Backend::Storage,
        Backend::Compute,
        Backend::Llm,
        Backend::Callable,
        Backend::Orchestration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Storage => "storage",
            Backend::Compute => "compute",
            Backend::Llm => "llm",
            Backend::Callable => "callable",
            Backend::Orchestration => "orchestration",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of step operations.
///
/// The backend is never declared independently: it is always derived from
/// the operation through [`Op::backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    ReadTable,
    WriteTable,
    AppendRows,
    DeleteRows,
    RunQuery,
    Transform,
    LlmComplete,
    LlmExtract,
    Call,
    EmitEvent,
    Checkpoint,
    Noop,
}

impl Op {
    /// Every operation, in declaration order.
    pub const ALL: [Op; 12] = [
        Op::ReadTable,
        Op::WriteTable,
        Op::AppendRows,
        Op::DeleteRows,
        Op::RunQuery,
        Op::Transform,
        Op::LlmComplete,
        Op::LlmExtract,
        Op::Call,
        Op::EmitEvent,
        Op::Checkpoint,
        Op::Noop,
    ];

    /// The backend that executes this operation.
    pub fn backend(&self) -> Backend {
        match self {
            Op::ReadTable | Op::WriteTable | Op::AppendRows | Op::DeleteRows => Backend::Storage,
            Op::RunQuery | Op::Transform => Backend::Compute,
            Op::LlmComplete | Op::LlmExtract => Backend::Llm,
            Op::Call => Backend::Callable,
            Op::EmitEvent | Op::Checkpoint | Op::Noop => Backend::Orchestration,
        }
    }

    /// Whether the operation writes to a storage backend.
    ///
    /// Only writes may carry an explicit idempotency configuration.
    pub fn is_write(&self) -> bool {
        matches!(self, Op::WriteTable | Op::AppendRows | Op::DeleteRows)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Op::ReadTable => "read_table",
            Op::WriteTable => "write_table",
            Op::AppendRows => "append_rows",
            Op::DeleteRows => "delete_rows",
            Op::RunQuery => "run_query",
            Op::Transform => "transform",
            Op::LlmComplete => "llm_complete",
            Op::LlmExtract => "llm_extract",
            Op::Call => "call",
            Op::EmitEvent => "emit_event",
            Op::Checkpoint => "checkpoint",
            Op::Noop => "noop",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Idempotency configuration
// ---------------------------------------------------------------------------

/// How a step's idempotency key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// `"{run_id}:{step_id}"` -- unique per run.
    #[default]
    Run,
    /// `"semantic:{value}"` -- value read from the resolved params.
    Semantic,
    /// `"explicit:{value}"` -- value of the `idempotency_key` param.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default)]
    pub scope: IdempotencyScope,
    /// Dotted path into the resolved params. Required iff `scope` is semantic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_key_ref: Option<String>,
    /// Append a short hash of the resolved params to the key.
    #[serde(default)]
    pub include_payload_hash: bool,
}

impl IdempotencyConfig {
    /// Check the scope/`semantic_key_ref` pairing.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match (self.scope, &self.semantic_key_ref) {
            (IdempotencyScope::Semantic, None) => {
                Err("scope 'semantic' requires semantic_key_ref".to_string())
            }
            (IdempotencyScope::Semantic, Some(key_ref)) if key_ref.trim().is_empty() => {
                Err("semantic_key_ref must not be empty".to_string())
            }
            (IdempotencyScope::Run | IdempotencyScope::Explicit, Some(_)) => Err(format!(
                "semantic_key_ref is only allowed with scope 'semantic' (got '{}')",
                serde_json::to_value(self.scope)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            )),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Job definition (source)
// ---------------------------------------------------------------------------

/// A single declared step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique within the job.
    pub step_id: String,
    pub op: Op,
    /// Arbitrary nested parameters. String leaves may be reference expressions.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Grouping label with no execution semantics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Compile-time condition over `@ctx.*` / `@payload.*` only.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyConfig>,
}

fn default_timeout_s() -> u64 {
    DEFAULT_STEP_TIMEOUT_S
}

impl StepDef {
    /// Minimal step with defaults for every optional field.
    pub fn new(step_id: impl Into<String>, op: Op) -> Self {
        Self {
            step_id: step_id.into(),
            op,
            params: Map::new(),
            phase_id: None,
            timeout_s: DEFAULT_STEP_TIMEOUT_S,
            continue_on_error: false,
            if_: None,
            idempotency: None,
        }
    }
}

/// The declarative source of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDef {
    pub job_id: String,
    pub version: String,
    pub steps: Vec<StepDef>,
    /// Unmodelled top-level keys, captured and re-serialized verbatim.
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl JobDef {
    /// Whether the definition is flagged `deprecated: true`.
    pub fn is_deprecated(&self) -> bool {
        self.extras
            .get("deprecated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Compiled instance
// ---------------------------------------------------------------------------

/// A compiled step. Same shape as `StepDef` minus `if`, plus `compiled_skip`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStepInstance {
    pub step_id: String,
    pub op: Op,
    /// Compile-time references resolved; `@run.*` references kept verbatim.
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    pub timeout_s: u64,
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyConfig>,
    /// True iff the step's `if` evaluated false at compile time.
    pub compiled_skip: bool,
}

impl JobStepInstance {
    /// The configured idempotency settings, defaulting to run scope.
    pub fn effective_idempotency(&self) -> IdempotencyConfig {
        self.idempotency.clone().unwrap_or_default()
    }
}

/// One compilation of a `JobDef` against a specific ctx/payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub job_id: String,
    pub job_version: String,
    /// Canonical-JSON SHA-256 of the source `JobDef`.
    pub job_def_sha256: String,
    pub compiled_at: DateTime<Utc>,
    /// Fixed length: always equal to the source step count.
    pub steps: Vec<JobStepInstance>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
