//! JavaScript-flavoured value semantics over `serde_json::Value`.
//!
//! Authored documents were written against JS truthiness and equality, so
//! conditions and transforms follow those rules. `None` stands for
//! `undefined` throughout.

use serde_json::{Number, Value};
use std::cmp::Ordering;

pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

pub fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// `ToNumber`; NaN for undefined and non-numeric input.
pub fn to_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Array(items)) => match items.as_slice() {
            [] => 0.0,
            [single] => to_number(Some(single)),
            _ => f64::NAN,
        },
        Some(Value::Object(_)) => f64::NAN,
    }
}

/// Integral values become JSON integers; NaN and infinities become `null`.
pub fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// String conversion used for text output and concatenation.
pub fn display(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => format_number(n),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                if is_nullish(Some(item)) {
                    String::new()
                } else {
                    display(Some(item))
                }
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

/// Like `display`, but nullish values render as an empty string.
pub fn display_text(value: Option<&Value>) -> String {
    if is_nullish(value) {
        String::new()
    } else {
        display(value)
    }
}

fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(f64::NAN);
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

pub fn type_of(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Null) | Some(Value::Array(_)) | Some(Value::Object(_)) => "object",
    }
}

/// `===`
pub fn strict_equals(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None, None) => true,
        (None, _) | (_, None) => false,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(a), Some(b)) => a == b,
    }
}

/// `==`
pub fn loose_equals(left: Option<&Value>, right: Option<&Value>) -> bool {
    if is_nullish(left) || is_nullish(right) {
        return is_nullish(left) && is_nullish(right);
    }
    match (left, right) {
        (Some(Value::String(_)), Some(Value::String(_))) => strict_equals(left, right),
        (Some(Value::Number(_) | Value::String(_) | Value::Bool(_)), Some(Value::Number(_)))
        | (Some(Value::Number(_)), Some(Value::String(_) | Value::Bool(_)))
        | (Some(Value::Bool(_)), Some(Value::String(_) | Value::Bool(_)))
        | (Some(Value::String(_)), Some(Value::Bool(_))) => {
            let (a, b) = (to_number(left), to_number(right));
            !a.is_nan() && a == b
        }
        _ => strict_equals(left, right),
    }
}

/// Relational ordering; `None` when the comparison is false either way (NaN).
pub fn compare(left: Option<&Value>, right: Option<&Value>) -> Option<Ordering> {
    if let (Some(Value::String(a)), Some(Value::String(b))) = (left, right) {
        return Some(a.cmp(b));
    }
    let (a, b) = (to_number(left), to_number(right));
    a.partial_cmp(&b)
}

/// Length as JS reports it: UTF-16 units for strings.
pub fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::String(s) => Some(s.encode_utf16().count()),
        _ => None,
    }
}
