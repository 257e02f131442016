//! Canonical JSON and SHA-256 content hashing.
//!
//! Canonical form: object keys sorted by their UTF-8 bytes at every depth,
//! no whitespace, `,` and `:` separators, strings escaped as JSON. The output
//! does not depend on the order keys were inserted or parsed in, so a job file
//! with reordered keys or different whitespace hashes identically.

use std::fmt::Write as _;

use jobflow_types::job::JobDef;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Serialize a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Canonical JSON of any serializable value.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Content hash of a job definition: SHA-256 over its canonical JSON.
///
/// Extras take part in the hash, so two definitions that differ only in
/// unmodelled top-level keys have different content addresses.
pub fn compute_hash(job_def: &JobDef) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json_of(job_def)?))
}

/// First 16 hex characters of the SHA-256 of canonical-JSON `params`.
pub fn payload_hash16(params: &Map<String, Value>) -> String {
    let mut full = sha256_hex(&canonical_json(&Value::Object(params.clone())));
    full.truncate(16);
    full
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys_at_every_depth() {
        let v = json!({"b": 1, "a": {"z": [true, null], "m": "x"}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"m":"x","z":[true,null]},"b":1}"#
        );
    }

    #[test]
    fn canonical_escapes_strings() {
        let v = json!({"s": "line\n\"quoted\"\u{01}"});
        assert_eq!(canonical_json(&v), r#"{"s":"line\n\"quoted\"\u0001"}"#);
    }

    #[test]
    fn canonical_matches_serde_for_sorted_input() {
        let v = json!({"a": 1.5, "b": [1, -2, "ü"], "c": {"d": false}});
        assert_eq!(canonical_json(&v), serde_json::to_string(&v).unwrap());
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_ignores_key_order_and_whitespace() {
        let a: JobDef = serde_yaml_ng::from_str(
            "job_id: j\nversion: '1'\nsteps:\n  - step_id: s1\n    op: noop\n    \
             params: {x: 1, y: 2}\n",
        )
        .unwrap();
        let b: JobDef = serde_json::from_str(
            r#"{ "steps": [ { "params": {"y": 2, "x": 1}, "op": "noop", "step_id": "s1" } ],
                 "version": "1", "job_id": "j" }"#,
        )
        .unwrap();
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&b).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let mut def: JobDef = serde_json::from_value(json!({
            "job_id": "j", "version": "1",
            "steps": [{"step_id": "s1", "op": "noop"}],
        }))
        .unwrap();
        let before = compute_hash(&def).unwrap();
        def.version = "2".to_string();
        assert_ne!(before, compute_hash(&def).unwrap());
    }

    #[test]
    fn payload_hash_is_16_hex_chars() {
        let params = json!({"table": "events"});
        let Value::Object(map) = params else { unreachable!() };
        let h = payload_hash16(&map);
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, payload_hash16(&map));
    }
}
