use serde_json::Value;

use crate::core::variable_pool::Segment;

pub(crate) fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string_vec(v: &Value) -> Vec<String> {
    match v {
        Value::Array(arr) => arr.iter().map(value_to_string).collect(),
        Value::String(s) => vec![s.clone()],
        _ => vec![],
    }
}

pub fn contains(actual: &Segment, expected: &Value) -> bool {
    let e = value_to_string(expected);
    match actual {
        Segment::String(s) => s.contains(&e),
        Segment::ArrayString(arr) => arr.iter().any(|s| s == &e),
        Segment::Array(arr) => arr.iter().any(|s| s.to_display_string() == e),
        _ => false,
    }
}

pub fn starts_with(actual: &Segment, expected: &Value) -> bool {
    matches!(actual, Segment::String(s) if s.starts_with(&value_to_string(expected)))
}

pub fn ends_with(actual: &Segment, expected: &Value) -> bool {
    matches!(actual, Segment::String(s) if s.ends_with(&value_to_string(expected)))
}

pub fn is(actual: &Segment, expected: &Value) -> bool {
    match (actual, expected) {
        (Segment::Boolean(a), Value::Bool(b)) => a == b,
        _ => actual.to_display_string() == value_to_string(expected),
    }
}

/// `in`: the actual value is a member of the expected list.
pub fn member_of(actual: &Segment, expected: &Value) -> bool {
    value_to_string_vec(expected).contains(&actual.to_display_string())
}

pub fn all_of(actual: &Segment, expected: &Value) -> bool {
    let expected_items = value_to_string_vec(expected);
    match actual {
        Segment::ArrayString(arr) => expected_items.iter().all(|e| arr.contains(e)),
        Segment::Array(arr) => {
            let actual_strs: Vec<String> = arr.iter().map(|s| s.to_display_string()).collect();
            expected_items.iter().all(|e| actual_strs.contains(e))
        }
        _ => false,
    }
}

/// Numeric comparison; false when either side is not a number.
pub fn compare_numeric<F>(actual: &Segment, expected: &Value, compare_fn: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (actual.as_f64(), value_to_f64(expected)) {
        (Some(a), Some(b)) => compare_fn(a, b),
        _ => false,
    }
}
