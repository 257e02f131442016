//! Reference expressions and their resolution.
//!
//! A reference is a string that is *exactly* `@namespace.path.to.value`, with
//! `namespace` one of `ctx`, `payload` or `run`. Strings that merely contain a
//! reference are passed through untouched: there is no interpolation.
//!
//! Resolution happens in two phases:
//! - compile time: `@ctx.*` against the caller context, `@payload.*` against
//!   the invocation payload. `@run.*` is either preserved verbatim or rejected.
//! - run time: `@run.<step_id>.*` against the outputs of earlier steps in the
//!   same attempt (plus the synthetic `envelope` entry).
//!
//! Resolution walks parameter trees recursively through objects and arrays.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// A path segment does not exist.
    #[error("cannot resolve '{reference}': key '{segment}' not found")]
    MissingKey { reference: String, segment: String },

    /// A path segment tried to descend into a scalar or array.
    #[error("cannot resolve '{reference}': '{segment}' is not a mapping")]
    NotAMapping { reference: String, segment: String },

    /// `@run.*` used where only compile-time references are allowed.
    #[error("'{reference}' is a run-time reference and cannot be resolved at compile time")]
    RunAtCompileTime { reference: String },

    /// `@run.<step_id>` names a step with no output in this attempt.
    #[error("cannot resolve '{reference}': no output for step '{step_id}'")]
    UnknownStep { reference: String, step_id: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Ctx,
    Payload,
    Run,
}

impl Namespace {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ctx" => Some(Namespace::Ctx),
            "payload" => Some(Namespace::Payload),
            "run" => Some(Namespace::Run),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Ctx => "ctx",
            Namespace::Payload => "payload",
            Namespace::Run => "run",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub namespace: Namespace,
    /// At least one segment.
    pub path: Vec<&'a str>,
    /// The full source text, for error messages.
    pub raw: &'a str,
}

/// Whether `s` can appear as one segment of a reference path: non-empty
/// `[A-Za-z0-9_-]`. Step ids must satisfy this to be addressable by `@run.*`.
pub fn is_path_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse `s` as a reference. Returns `None` for anything that is not an exact match.
pub fn parse_reference(s: &str) -> Option<Reference<'_>> {
    let body = s.strip_prefix('@')?;
    let mut parts = body.split('.');
    let namespace = Namespace::parse(parts.next()?)?;
    let path: Vec<&str> = parts.collect();
    if path.is_empty() || !path.iter().all(|seg| is_path_segment(seg)) {
        return None;
    }
    Some(Reference {
        namespace,
        path,
        raw: s,
    })
}

/// Whether `s` is exactly a reference expression.
pub fn is_reference(s: &str) -> bool {
    parse_reference(s).is_some()
}

/// First string leaf in `value` that is still a reference, if any.
pub fn find_reference(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => is_reference(s).then_some(s.as_str()),
        Value::Array(items) => items.iter().find_map(find_reference),
        Value::Object(map) => map.values().find_map(find_reference),
        Value::Null | Value::Bool(_) | Value::Number(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Path navigation
// ---------------------------------------------------------------------------

/// Walk `path` through nested mappings starting at `root`.
///
/// `reference` is only used to build error messages.
pub fn navigate<'v>(
    root: &'v Map<String, Value>,
    path: &[&str],
    reference: &str,
) -> Result<&'v Value, ReferenceError> {
    let Some((first, rest)) = path.split_first() else {
        return Err(ReferenceError::MissingKey {
            reference: reference.to_string(),
            segment: String::new(),
        });
    };
    let mut current = root.get(*first).ok_or_else(|| ReferenceError::MissingKey {
        reference: reference.to_string(),
        segment: first.to_string(),
    })?;
    for segment in rest {
        let Value::Object(map) = current else {
            return Err(ReferenceError::NotAMapping {
                reference: reference.to_string(),
                segment: segment.to_string(),
            });
        };
        current = map.get(*segment).ok_or_else(|| ReferenceError::MissingKey {
            reference: reference.to_string(),
            segment: segment.to_string(),
        })?;
    }
    Ok(current)
}

/// Look up a dotted path (`a.b.c`) in a mapping. Missing paths yield `None`.
pub fn lookup_path<'v>(root: &'v Map<String, Value>, dotted: &str) -> Option<&'v Value> {
    let segments: Vec<&str> = dotted.split('.').collect();
    navigate(root, &segments, dotted).ok()
}

// ---------------------------------------------------------------------------
// Tree resolution
// ---------------------------------------------------------------------------

/// Recursively rebuild `value`, replacing reference strings via `lookup`.
///
/// `lookup` returns `Ok(None)` to keep a reference verbatim.
fn resolve_tree<F>(value: &Value, lookup: &F) -> Result<Value, ReferenceError>
where
    F: Fn(&Reference<'_>) -> Result<Option<Value>, ReferenceError>,
{
    match value {
        Value::String(s) => match parse_reference(s) {
            Some(reference) => Ok(lookup(&reference)?.unwrap_or_else(|| value.clone())),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_tree(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_map(map, lookup).map(Value::Object),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn resolve_map<F>(
    map: &Map<String, Value>,
    lookup: &F,
) -> Result<Map<String, Value>, ReferenceError>
where
    F: Fn(&Reference<'_>) -> Result<Option<Value>, ReferenceError>,
{
    map.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_tree(v, lookup)?)))
        .collect()
}

/// Resolve a single compile-time reference against ctx/payload.
///
/// `@run.*` is always an error here.
pub fn resolve_compile_reference(
    reference: &Reference<'_>,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<Value, ReferenceError> {
    let root = match reference.namespace {
        Namespace::Ctx => ctx,
        Namespace::Payload => payload,
        Namespace::Run => {
            return Err(ReferenceError::RunAtCompileTime {
                reference: reference.raw.to_string(),
            });
        }
    };
    navigate(root, &reference.path, reference.raw).cloned()
}

/// Resolve compile-time references throughout a parameter tree.
///
/// With `preserve_run`, `@run.*` strings are kept verbatim for execution time;
/// without it they are an error.
pub fn resolve_compile_time(
    params: &Map<String, Value>,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
    preserve_run: bool,
) -> Result<Map<String, Value>, ReferenceError> {
    resolve_map(params, &|reference: &Reference<'_>| {
        if preserve_run && reference.namespace == Namespace::Run {
            return Ok(None);
        }
        resolve_compile_reference(reference, ctx, payload).map(Some)
    })
}

/// Resolve `@run.<step_id>.*` references against prior step outputs.
///
/// `outputs` maps step ids (and `envelope`) to their values. Other namespaces
/// are left untouched.
pub fn resolve_run_time(
    params: &Map<String, Value>,
    outputs: &Map<String, Value>,
) -> Result<Map<String, Value>, ReferenceError> {
    resolve_map(params, &|reference: &Reference<'_>| {
        if reference.namespace != Namespace::Run {
            return Ok(None);
        }
        let step_id = reference.path[0];
        if !outputs.contains_key(step_id) {
            return Err(ReferenceError::UnknownStep {
                reference: reference.raw.to_string(),
                step_id: step_id.to_string(),
            });
        }
        navigate(outputs, &reference.path, reference.raw)
            .cloned()
            .map(Some)
    })
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

    #[test]
    fn parses_exact_references_only() {
        let r = parse_reference("@ctx.db.name").unwrap();
        assert_eq!(r.namespace, Namespace::Ctx);
        assert_eq!(r.path, vec!["db", "name"]);

        assert!(parse_reference("@run.step-a.items").is_some());
        assert!(parse_reference("@payload.user_id").is_some());

        assert!(parse_reference("@ctx").is_none());
        assert!(parse_reference("@ctx.").is_none());
        assert!(parse_reference("@ctx..a").is_none());
        assert!(parse_reference("@env.home").is_none());
        assert!(parse_reference("ctx.a").is_none());
        assert!(parse_reference("prefix @ctx.a").is_none());
        assert!(parse_reference("@ctx.a suffix").is_none());
    }

    #[test]
    fn compile_time_resolves_nested_trees() {
        let ctx = obj(json!({"db": {"name": "warehouse"}, "limit": 10}));
        let payload = obj(json!({"ids": [1, 2]}));
        let params = obj(json!({
            "table": "@ctx.db.name",
            "filters": [{"ids": "@payload.ids"}, "literal"],
            "limit": "@ctx.limit",
            "note": "uses @ctx.db.name inline",
        }));

        let resolved = resolve_compile_time(&params, &ctx, &payload, true).unwrap();
        assert_eq!(resolved["table"], json!("warehouse"));
        assert_eq!(resolved["filters"][0]["ids"], json!([1, 2]));
        assert_eq!(resolved["filters"][1], json!("literal"));
        assert_eq!(resolved["limit"], json!(10));
        assert_eq!(resolved["note"], json!("uses @ctx.db.name inline"));
    }

    #[test]
    fn compile_time_preserves_run_refs_when_asked() {
        let params = obj(json!({"count": "@run.A.items"}));
        let resolved = resolve_compile_time(&params, &Map::new(), &Map::new(), true).unwrap();
        assert_eq!(resolved["count"], json!("@run.A.items"));
    }

    #[test]
    fn compile_time_rejects_run_refs_otherwise() {
        let params = obj(json!({"count": "@run.A.items"}));
        let err = resolve_compile_time(&params, &Map::new(), &Map::new(), false).unwrap_err();
        assert!(matches!(err, ReferenceError::RunAtCompileTime { .. }));
    }

    #[test]
    fn missing_key_names_segment() {
        let ctx = obj(json!({"db": {"name": "x"}}));
        let params = obj(json!({"t": "@ctx.db.schema"}));
        let err = resolve_compile_time(&params, &ctx, &Map::new(), true).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::MissingKey {
                reference: "@ctx.db.schema".to_string(),
                segment: "schema".to_string(),
            }
        );
    }

    #[test]
    fn navigating_into_scalar_is_an_error() {
        let ctx = obj(json!({"db": "flat"}));
        let params = obj(json!({"t": "@ctx.db.name"}));
        let err = resolve_compile_time(&params, &ctx, &Map::new(), true).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::NotAMapping { ref segment, .. } if segment == "name"
        ));
    }

    #[test]
    fn run_time_resolves_prior_outputs() {
        let outputs = obj(json!({
            "A": {"items": [1, 2, 3]},
            "envelope": {"trigger": "cron"},
        }));
        let params = obj(json!({
            "count": "@run.A.items",
            "whole": "@run.A",
            "trigger": "@run.envelope.trigger",
        }));
        let resolved = resolve_run_time(&params, &outputs).unwrap();
        assert_eq!(resolved["count"], json!([1, 2, 3]));
        assert_eq!(resolved["whole"], json!({"items": [1, 2, 3]}));
        assert_eq!(resolved["trigger"], json!("cron"));
    }

    #[test]
    fn run_time_unknown_step_is_an_error() {
        let params = obj(json!({"x": "@run.missing.value"}));
        let err = resolve_run_time(&params, &Map::new()).unwrap_err();
        assert_eq!(
            err,
            ReferenceError::UnknownStep {
                reference: "@run.missing.value".to_string(),
                step_id: "missing".to_string(),
            }
        );
    }

    #[test]
    fn find_reference_detects_leftovers() {
        assert_eq!(
            find_reference(&json!({"a": [1, {"b": "@ctx.x"}]})),
            Some("@ctx.x")
        );
        assert_eq!(find_reference(&json!({"a": "plain @ctx.x"})), None);
    }

    #[test]
    fn lookup_path_walks_dotted_paths() {
        let root = obj(json!({"target": {"table": "events"}}));
        assert_eq!(lookup_path(&root, "target.table"), Some(&json!("events")));
        assert_eq!(lookup_path(&root, "target.schema"), None);
    }
}
