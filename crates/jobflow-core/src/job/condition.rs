//! Compile-time `if` condition evaluation.
//!
//! Two forms are supported:
//! - a bare reference (`@ctx.enabled`), coerced to a boolean;
//! - a single binary comparison `LHS <op> RHS` with `op` one of
//!   `==`, `!=`, `>=`, `<=`, `>`, `<`.
//!
//! Each comparison side is either a reference (resolved against ctx/payload)
//! or a literal: `true`/`false`, `null`, a number, a quoted string, or else
//! the bare text itself. A token starting with `@` must be a well-formed
//! reference, and an expression without an operator must be one.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::reference::{ReferenceError, parse_reference, resolve_compile_reference};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition references run-time output: '{0}'")]
    RunReference(String),

    #[error("empty condition")]
    Empty,

    #[error("malformed reference '{0}'")]
    MalformedReference(String),

    #[error("'{0}' is neither a reference nor a comparison")]
    NotAComparison(String),

    #[error("missing operand in '{0}'")]
    MissingOperand(String),

    #[error("cannot order {left} and {right} with '{op}'")]
    Incomparable {
        left: String,
        right: String,
        op: &'static str,
    },

    #[error(transparent)]
    Reference(#[from] ReferenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
        }
    }
}

// Two-character operators must be tried before their one-character prefixes.
const OPERATORS: [CmpOp; 6] = [
    CmpOp::Eq,
    CmpOp::Ne,
    CmpOp::Ge,
    CmpOp::Le,
    CmpOp::Gt,
    CmpOp::Lt,
];

/// Whether an `if` string mentions a run-time reference anywhere.
pub fn mentions_run_reference(expr: &str) -> bool {
    expr.contains("@run.")
}

/// Evaluate a compile-time condition.
pub fn evaluate_condition(
    expr: &str,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<bool, ConditionError> {
    if mentions_run_reference(expr) {
        return Err(ConditionError::RunReference(expr.to_string()));
    }
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ConditionError::Empty);
    }

    let Some((lhs, op, rhs)) = split_comparison(expr) else {
        if !expr.starts_with('@') {
            return Err(ConditionError::NotAComparison(expr.to_string()));
        }
        return Ok(truthy(&operand(expr, ctx, payload)?));
    };
    if lhs.is_empty() || rhs.is_empty() {
        return Err(ConditionError::MissingOperand(expr.to_string()));
    }

    let left = operand(lhs, ctx, payload)?;
    let right = operand(rhs, ctx, payload)?;
    compare(&left, op, &right)
}

/// Find the first operator outside of quotes.
fn split_comparison(expr: &str) -> Option<(&str, CmpOp, &str)> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None => {
                for op in OPERATORS {
                    let token = op.as_str().as_bytes();
                    if bytes[i..].starts_with(token) {
                        let lhs = expr[..i].trim();
                        let rhs = expr[i + token.len()..].trim();
                        return Some((lhs, op, rhs));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn operand(
    token: &str,
    ctx: &Map<String, Value>,
    payload: &Map<String, Value>,
) -> Result<Value, ConditionError> {
    match parse_reference(token) {
        Some(reference) => Ok(resolve_compile_reference(&reference, ctx, payload)?),
        None if token.starts_with('@') => {
            Err(ConditionError::MalformedReference(token.to_string()))
        }
        None => Ok(parse_literal(token)),
    }
}

fn parse_literal(token: &str) -> Value {
    match token {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        "null" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = token.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = token.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    let quoted = token.len() >= 2
        && ((token.starts_with('"') && token.ends_with('"'))
            || (token.starts_with('\'') && token.ends_with('\'')));
    if quoted {
        return Value::String(token[1..token.len() - 1].to_string());
    }
    Value::String(token.to_string())
}

/// Boolean coercion: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality without cross-type coercion: numbers compare by value (`1 == 1.0`),
/// everything else must match in type, so `true == 1` and `'1' == 1` are false.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // 1 == 1.0
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, ConditionError> {
    let ord = || {
        ordering(left, right).ok_or_else(|| ConditionError::Incomparable {
            left: type_name(left).to_string(),
            right: type_name(right).to_string(),
            op: op.as_str(),
        })
    };
    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Ge => ord()? != Ordering::Less,
        CmpOp::Le => ord()? != Ordering::Greater,
        CmpOp::Gt => ord()? == Ordering::Greater,
        CmpOp::Lt => ord()? == Ordering::Less,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
