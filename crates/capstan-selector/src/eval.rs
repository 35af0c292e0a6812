//! Null-safe evaluation of selector expressions against a document.
//!
//! Unknown fields resolve to null, indexing null yields null, and
//! string/boolean operators treat null operands as false. Only
//! structurally invalid programs (bad regex, unknown method) surface
//! errors; callers classify those as "no match".

use regex::Regex;
use serde_json::Value;

use crate::ast::{BinOp, Expr, UnaryOp};
use crate::error::{SelectorError, SelectorResult};

/// Evaluate an expression against a document.
pub fn eval(expr: &Expr, doc: &Value) -> SelectorResult<Value> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(lookup(doc, name)),
        Expr::Member(recv, field) => {
            let base = eval(recv, doc)?;
            Ok(lookup(&base, field))
        }
        Expr::Index(recv, index) => {
            let base = eval(recv, doc)?;
            let key = eval(index, doc)?;
            Ok(index_value(&base, &key))
        }
        Expr::Call { recv, method, args } => {
            let base = eval(recv, doc)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, doc)?);
            }
            call_method(&base, method, &values)
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, doc)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!truthy(&v)),
                UnaryOp::Neg => match as_f64(&v) {
                    Some(n) => serde_json::json!(-n),
                    None => Value::Null,
                },
            })
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, doc),
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, doc: &Value) -> SelectorResult<Value> {
    // Short-circuit the boolean combinators.
    match op {
        BinOp::Or => {
            if truthy(&eval(left, doc)?) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&eval(right, doc)?)));
        }
        BinOp::And => {
            if !truthy(&eval(left, doc)?) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&eval(right, doc)?)));
        }
        _ => {}
    }

    let lhs = eval(left, doc)?;
    let rhs = eval(right, doc)?;
    let result = match op {
        BinOp::Eq => value_eq(&lhs, &rhs),
        BinOp::Ne => !value_eq(&lhs, &rhs),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &lhs, &rhs),
        BinOp::In => contains(&rhs, &lhs),
        BinOp::Or | BinOp::And => unreachable!(),
    };
    Ok(Value::Bool(result))
}

/// Field lookup; anything that is not an object with the field is null.
fn lookup(base: &Value, field: &str) -> Value {
    match base {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index_value(base: &Value, key: &Value) -> Value {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), key) => match as_f64(key) {
            Some(n) if n >= 0.0 => items.get(n as usize).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn call_method(recv: &Value, method: &str, args: &[Value]) -> SelectorResult<Value> {
    match method {
        "startsWith" => Ok(Value::Bool(str_pair(recv, args).is_some_and(|(s, p)| s.starts_with(p)))),
        "endsWith" => Ok(Value::Bool(str_pair(recv, args).is_some_and(|(s, p)| s.ends_with(p)))),
        "contains" => Ok(Value::Bool(match recv {
            Value::String(s) => args
                .first()
                .and_then(Value::as_str)
                .is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => args
                .first()
                .is_some_and(|needle| items.iter().any(|item| value_eq(item, needle))),
            _ => false,
        })),
        "matches" => {
            let Some((s, pattern)) = str_pair(recv, args) else {
                return Ok(Value::Bool(false));
            };
            let re = Regex::new(pattern).map_err(|e| SelectorError::InvalidRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            Ok(Value::Bool(re.is_match(s)))
        }
        "size" => Ok(match recv {
            Value::String(s) => serde_json::json!(s.chars().count()),
            Value::Array(items) => serde_json::json!(items.len()),
            Value::Object(map) => serde_json::json!(map.len()),
            _ => Value::Null,
        }),
        other => Err(SelectorError::UnknownMethod(other.to_string())),
    }
}

fn str_pair<'a>(recv: &'a Value, args: &'a [Value]) -> Option<(&'a str, &'a str)> {
    Some((recv.as_str()?, args.first()?.as_str()?))
}

/// Strict truthiness: only boolean true counts.
fn truthy(v: &Value) -> bool {
    matches!(v, Value::Bool(true))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

/// Deep equality with numeric coercion (1 == 1.0).
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn compare(op: BinOp, a: &Value, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => false,
    }
}

/// `needle in haystack` semantics.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| value_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        Value::String(s) => needle.as_str().is_some_and(|sub| s.contains(sub)),
        _ => false,
    }
}
