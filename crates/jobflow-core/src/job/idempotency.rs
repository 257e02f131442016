//! Idempotency key derivation.
//!
//! Keys are a pure function of `(run_id, step_id, resolved_params, config)`:
//! - run scope: `{run_id}:{step_id}`
//! - semantic scope: `semantic:{value at semantic_key_ref}`
//! - explicit scope: `explicit:{resolved_params.idempotency_key}`
//!
//! With `include_payload_hash`, `:{payload_hash16(resolved_params)}` is appended.
//! String values are used as is; anything else is rendered as canonical JSON.

use jobflow_types::job::{IdempotencyConfig, IdempotencyScope};
use serde_json::{Map, Value};
use thiserror::Error;

use super::hash::{canonical_json, payload_hash16};
use super::reference::lookup_path;

/// Param consulted by the explicit scope.
pub const EXPLICIT_KEY_PARAM: &str = "idempotency_key";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    #[error("semantic scope requires semantic_key_ref")]
    MissingSemanticRef,

    #[error("semantic key '{0}' not found in resolved params")]
    MissingSemanticValue(String),

    #[error("explicit scope requires an 'idempotency_key' param")]
    MissingExplicitKey,
}

fn key_fragment(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(canonical_json(other)),
    }
}

/// Derive the idempotency key for one step execution.
pub fn derive_idempotency_key(
    run_id: &str,
    step_id: &str,
    resolved_params: &Map<String, Value>,
    config: &IdempotencyConfig,
) -> Result<String, IdempotencyError> {
    let base = match config.scope {
        IdempotencyScope::Run => format!("{run_id}:{step_id}"),
        IdempotencyScope::Semantic => {
            let key_ref = config
                .semantic_key_ref
                .as_deref()
                .ok_or(IdempotencyError::MissingSemanticRef)?;
            let value = lookup_path(resolved_params, key_ref)
                .and_then(key_fragment)
                .ok_or_else(|| IdempotencyError::MissingSemanticValue(key_ref.to_string()))?;
            format!("semantic:{value}")
        }
        IdempotencyScope::Explicit => {
            let value = resolved_params
                .get(EXPLICIT_KEY_PARAM)
                .and_then(key_fragment)
                .ok_or(IdempotencyError::MissingExplicitKey)?;
            format!("explicit:{value}")
        }
    };

    if config.include_payload_hash {
        Ok(format!("{base}:{}", payload_hash16(resolved_params)))
    } else {
        Ok(base)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn config(scope: IdempotencyScope, key_ref: Option<&str>, hash: bool) -> IdempotencyConfig {
        IdempotencyConfig {
            scope,
            semantic_key_ref: key_ref.map(str::to_string),
            include_payload_hash: hash,
        }
    }

    #[test]
    fn run_scope_is_run_and_step() {
        let key = derive_idempotency_key("R1", "s1", &Map::new(), &IdempotencyConfig::default())
            .unwrap();
        assert_eq!(key, "R1:s1");
    }

    #[test]
    fn run_scope_ignores_params() {
        let cfg = IdempotencyConfig::default();
        let a = derive_idempotency_key("R1", "s1", &obj(json!({"x": 1})), &cfg).unwrap();
        let b = derive_idempotency_key("R1", "s1", &obj(json!({"x": 2, "y": 3})), &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let params = obj(json!({"target": {"table": "events"}, "rows": [1, 2]}));
        let cfg = config(IdempotencyScope::Semantic, Some("target.table"), true);
        assert_eq!(
            derive_idempotency_key("R1", "s1", &params, &cfg).unwrap(),
            derive_idempotency_key("R1", "s1", &params, &cfg).unwrap()
        );
    }

    #[test]
    fn payload_hash_changes_key() {
        let params = obj(json!({"table": "events"}));
        let plain_cfg = config(IdempotencyScope::Run, None, false);
        let hashed_cfg = config(IdempotencyScope::Run, None, true);
        let plain = derive_idempotency_key("R1", "s1", &params, &plain_cfg).unwrap();
        let hashed = derive_idempotency_key("R1", "s1", &params, &hashed_cfg).unwrap();
        assert_ne!(plain, hashed);
        assert!(hashed.starts_with("R1:s1:"));
        assert_eq!(hashed.len(), "R1:s1:".len() + 16);
    }

    #[test]
    fn semantic_scope_reads_nested_value() {
        let params = obj(json!({"target": {"table": "events", "partition": 20240101}}));
        let key = derive_idempotency_key(
            "R1",
            "s1",
            &params,
            &config(IdempotencyScope::Semantic, Some("target.table"), false),
        )
        .unwrap();
        assert_eq!(key, "semantic:events");

        let key = derive_idempotency_key(
            "R2",
            "s1",
            &params,
            &config(IdempotencyScope::Semantic, Some("target.partition"), false),
        )
        .unwrap();
        assert_eq!(key, "semantic:20240101");
    }

    #[test]
    fn semantic_scope_missing_value_is_an_error() {
        let err = derive_idempotency_key(
            "R1",
            "s1",
            &obj(json!({"target": {}})),
            &config(IdempotencyScope::Semantic, Some("target.table"), false),
        )
        .unwrap_err();
        assert_eq!(err, IdempotencyError::MissingSemanticValue("target.table".to_string()));

        let err = derive_idempotency_key(
            "R1",
            "s1",
            &Map::new(),
            &config(IdempotencyScope::Semantic, None, false),
        )
        .unwrap_err();
        assert_eq!(err, IdempotencyError::MissingSemanticRef);
    }

    #[test]
    fn explicit_scope_uses_param() {
        let key = derive_idempotency_key(
            "R1",
            "s1",
            &obj(json!({"idempotency_key": "load-2024-01-01"})),
            &config(IdempotencyScope::Explicit, None, false),
        )
        .unwrap();
        assert_eq!(key, "explicit:load-2024-01-01");
    }

    #[test]
    fn explicit_scope_missing_key_is_an_error() {
        for params in [json!({"table": "events"}), json!({"idempotency_key": null})] {
            let err = derive_idempotency_key(
                "R1",
                "s1",
                &obj(params),
                &config(IdempotencyScope::Explicit, None, false),
            )
            .unwrap_err();
            assert_eq!(err, IdempotencyError::MissingExplicitKey);
        }
    }
}
