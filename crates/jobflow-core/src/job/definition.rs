//! Job definition parsing, structural validation and file loading.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use jobflow_types::job::JobDef;
use serde_json::Value;
use thiserror::Error;

use super::reference::is_path_segment;

/// Step id reserved for the synthetic run envelope in `@run.*` lookups.
pub const ENVELOPE_STEP_ID: &str = "envelope";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Registry-level errors.
///
/// `NotFound` and `Validation` are kept apart: "doesn't exist" and "exists but
/// is malformed" need different remediation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job '{job_id}' not found{}", version_suffix(.version))]
    NotFound {
        job_id: String,
        version: Option<String>,
    },

    #[error("job '{job_id}' is invalid: {reason}")]
    Validation { job_id: String, reason: String },

    #[error("failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_ref()
        .map(|v| format!(" at version '{v}'"))
        .unwrap_or_default()
}

/// Structural problems in a `JobDef`, shared by the registry and the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("job_id must not be empty")]
    EmptyJobId,

    #[error("version must not be empty")]
    EmptyVersion,

    #[error("job must have at least one step")]
    NoSteps,

    #[error("duplicate step_id '{0}'")]
    DuplicateStepId(String),

    #[error("step_id must not be empty")]
    EmptyStepId,

    #[error("step_id '{0}' may only contain ASCII letters, digits, '_' and '-'")]
    InvalidStepId(String),

    #[error("step_id '{0}' is reserved")]
    ReservedStepId(String),

    #[error("step '{0}': timeout_s must be greater than zero")]
    ZeroTimeout(String),

    #[error("step '{step_id}': invalid idempotency config: {reason}")]
    InvalidIdempotency { step_id: String, reason: String },

    #[error("step '{step_id}': idempotency config is only allowed on write operations (op '{op}')")]
    IdempotencyOnNonWrite { step_id: String, op: String },
}

/// Check the structural rules every definition must satisfy.
pub fn check_structure(def: &JobDef) -> Result<(), StructureError> {
    if def.job_id.trim().is_empty() {
        return Err(StructureError::EmptyJobId);
    }
    if def.version.trim().is_empty() {
        return Err(StructureError::EmptyVersion);
    }
    if def.steps.is_empty() {
        return Err(StructureError::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.step_id.trim().is_empty() {
            return Err(StructureError::EmptyStepId);
        }
        if !is_path_segment(&step.step_id) {
            return Err(StructureError::InvalidStepId(step.step_id.clone()));
        }
        if step.step_id == ENVELOPE_STEP_ID {
            return Err(StructureError::ReservedStepId(step.step_id.clone()));
        }
        if !seen.insert(step.step_id.as_str()) {
            return Err(StructureError::DuplicateStepId(step.step_id.clone()));
        }
        if step.timeout_s == 0 {
            return Err(StructureError::ZeroTimeout(step.step_id.clone()));
        }
        if let Some(cfg) = &step.idempotency {
            if !step.op.is_write() {
                return Err(StructureError::IdempotencyOnNonWrite {
                    step_id: step.step_id.clone(),
                    op: step.op.to_string(),
                });
            }
            cfg.validate()
                .map_err(|reason| StructureError::InvalidIdempotency {
                    step_id: step.step_id.clone(),
                    reason,
                })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Supported definition file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Recognised extensions, most preferred first.
    pub const EXTENSIONS: [&'static str; 3] = ["yaml", "yml", "json"];

    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(DefinitionFormat::Yaml),
            "json" => Some(DefinitionFormat::Json),
            _ => None,
        }
    }

    /// Lower is preferred when one job id exists in several formats.
    pub fn preference(path: &Path) -> usize {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| Self::EXTENSIONS.iter().position(|x| *x == e))
            .unwrap_or(usize::MAX)
    }
}

/// Parse a definition document.
pub fn parse_job_def(content: &str, format: DefinitionFormat) -> Result<JobDef, String> {
    match format {
        DefinitionFormat::Yaml => serde_yaml_ng::from_str(content).map_err(|e| e.to_string()),
        DefinitionFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    }
}

/// Parse a standalone structured document into a JSON value.
fn parse_document(path: &Path) -> Result<Value, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let parsed = match DefinitionFormat::from_path(path) {
        Some(DefinitionFormat::Json) => serde_json::from_str(&content).map_err(|e| e.to_string()),
        _ => serde_yaml_ng::from_str(&content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| RegistryError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Substitute string extras that name a structured document next to the definition.
///
/// Only direct top-level string values ending in a recognised extension are
/// considered, and only when the file exists; anything else is left as is.
fn compose_extras(def: &mut JobDef, base_dir: &Path) -> Result<(), RegistryError> {
    for value in def.extras.values_mut() {
        let Value::String(candidate) = value else {
            continue;
        };
        let candidate_path = Path::new(candidate.as_str());
        if DefinitionFormat::from_path(candidate_path).is_none() {
            continue;
        }
        let resolved = if candidate_path.is_absolute() {
            candidate_path.to_path_buf()
        } else {
            base_dir.join(candidate_path)
        };
        if !resolved.is_file() {
            continue;
        }
        tracing::debug!(path = %resolved.display(), "substituting extras document");
        *value = parse_document(&resolved)?;
    }
    Ok(())
}

/// Load and parse a definition file, composing path-valued extras inline.
///
/// Structural validation is left to the caller.
pub fn load_job_file(path: &Path) -> Result<JobDef, RegistryError> {
    let format = DefinitionFormat::from_path(path).ok_or_else(|| RegistryError::Parse {
        path: path.to_path_buf(),
        reason: "unsupported file extension".to_string(),
    })?;
    let content = std::fs::read_to_string(path)?;
    let mut def = parse_job_def(&content, format).map_err(|reason| RegistryError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    compose_extras(&mut def, base_dir)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// All definition files under `root`, recursively, sorted by path.
///
/// A missing root yields an empty list.
pub fn discover_definition_files(root: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let mut files = Vec::new();
    if root.is_dir() {
        discover_recursive(root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn discover_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), RegistryError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, files)?;
        } else if DefinitionFormat::from_path(&path).is_some() {
            files.push(path);
        }
    }
    Ok(())
}

/// The job id a definition file claims by name.
pub fn file_job_id(path: &Path) -> Option<&str> {
    path.file_stem()?.to_str()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_types::job::{IdempotencyConfig, IdempotencyScope, Op, StepDef};
    use serde_json::json;
    use tempfile::TempDir;

    fn job(steps: Vec<StepDef>) -> JobDef {
        JobDef {
            job_id: "nightly".to_string(),
            version: "1.0.0".to_string(),
            steps,
            extras: Default::default(),
        }
    }

    #[test]
    fn valid_structure_passes() {
        let def = job(vec![StepDef::new("a", Op::ReadTable), StepDef::new("b", Op::WriteTable)]);
        assert!(check_structure(&def).is_ok());
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let def = job(vec![StepDef::new("a", Op::Noop), StepDef::new("a", Op::Noop)]);
        assert_eq!(
            check_structure(&def),
            Err(StructureError::DuplicateStepId("a".to_string()))
        );
    }

    #[test]
    fn rejects_empty_job_and_reserved_ids() {
        assert_eq!(check_structure(&job(vec![])), Err(StructureError::NoSteps));

        let mut def = job(vec![StepDef::new("a", Op::Noop)]);
        def.job_id = " ".to_string();
        assert_eq!(check_structure(&def), Err(StructureError::EmptyJobId));

        let def = job(vec![StepDef::new("envelope", Op::Noop)]);
        assert!(matches!(
            check_structure(&def),
            Err(StructureError::ReservedStepId(_))
        ));
    }

    #[test]
    fn step_ids_must_be_addressable() {
        for id in ["load/v2", "load.v2", "load v2", "..", "étape"] {
            assert_eq!(
                check_structure(&job(vec![StepDef::new(id, Op::Noop)])),
                Err(StructureError::InvalidStepId(id.to_string())),
                "{id}"
            );
        }
        let def = job(vec![StepDef::new("load_v2-final", Op::Noop)]);
        assert!(check_structure(&def).is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut step = StepDef::new("a", Op::Noop);
        step.timeout_s = 0;
        assert!(matches!(
            check_structure(&job(vec![step])),
            Err(StructureError::ZeroTimeout(_))
        ));
    }

    #[test]
    fn idempotency_only_on_writes() {
        let mut step = StepDef::new("read", Op::ReadTable);
        step.idempotency = Some(IdempotencyConfig::default());
        assert!(matches!(
            check_structure(&job(vec![step])),
            Err(StructureError::IdempotencyOnNonWrite { .. })
        ));

        let mut step = StepDef::new("write", Op::WriteTable);
        step.idempotency = Some(IdempotencyConfig {
            scope: IdempotencyScope::Semantic,
            semantic_key_ref: None,
            include_payload_hash: false,
        });
        assert!(matches!(
            check_structure(&job(vec![step])),
            Err(StructureError::InvalidIdempotency { .. })
        ));
    }

    #[test]
    fn format_preference_orders_yaml_first() {
        assert!(
            DefinitionFormat::preference(Path::new("a.yaml"))
                < DefinitionFormat::preference(Path::new("a.yml"))
        );
        assert!(
            DefinitionFormat::preference(Path::new("a.yml"))
                < DefinitionFormat::preference(Path::new("a.json"))
        );
        assert_eq!(DefinitionFormat::from_path(Path::new("a.txt")), None);
    }

    #[test]
    fn load_composes_path_extras() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("creds.yaml"),
            "account: loader\nscopes: [read, write]\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("nightly.yaml"),
            r#"
job_id: nightly
version: "1.0.0"
service_account: creds.yaml
missing_doc: absent.yaml
owner: data-team
steps:
  - step_id: s1
    op: noop
"#,
        )
        .unwrap();

        let def = load_job_file(&tmp.path().join("nightly.yaml")).unwrap();
        assert_eq!(
            def.extras.get("service_account"),
            Some(&json!({"account": "loader", "scopes": ["read", "write"]}))
        );
        assert_eq!(def.extras.get("missing_doc"), Some(&json!("absent.yaml")));
        assert_eq!(def.extras.get("owner"), Some(&json!("data-team")));
    }

    #[test]
    fn load_reports_parse_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_job_file(&path),
            Err(RegistryError::Parse { .. })
        ));
    }

    #[test]
    fn discovery_is_recursive_and_sorted() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("team/sub")).unwrap();
        std::fs::write(tmp.path().join("b.yaml"), "").unwrap();
        std::fs::write(tmp.path().join("team/sub/a.json"), "").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "").unwrap();

        let files = discover_definition_files(tmp.path()).unwrap();
        let names: Vec<&str> = files.iter().filter_map(|p| file_job_id(p)).collect();
        assert_eq!(files.len(), 2);
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
        assert!(discover_definition_files(&tmp.path().join("nope")).unwrap().is_empty());
    }
}
