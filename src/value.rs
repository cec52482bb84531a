//! Helpers implementing the spec's explicit cast/equality/ordering rules over
//! `serde_json::Value`. We keep `serde_json::Value` as the wire/storage type
//! (matching the teacher crate) rather than introducing a parallel tagged
//! enum, but route every comparison through these functions instead of ad
//! hoc `match` arms, so the cast rules live in one auditable place.
use serde_json::{Number, Value};

/// The attribute's runtime type tag, per the `$type` operator and `FeatureResult.on`.
pub fn js_typeof(value: Option<&Value>) -> &'static str {
    match value {
        None => "unknown",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// JS-truthy: used to derive `FeatureResult.on`/`off`.
pub fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) => true,
        Value::Object(_) => true,
    }
}

/// JS-like equality: numbers compare as floats regardless of internal
/// representation, arrays/objects recurse, cross-type values are unequal.
pub fn js_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| js_equal(a, b)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |v2| js_equal(v, v2)))
        }
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Cast to Number per spec: arrays of 0/1 elements, string parsing, bools, null, objects.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        Value::Array(arr) => match arr.len() {
            0 => Some(0.0),
            1 => to_number(&arr[0]),
            _ => None,
        },
        Value::Object(_) => None,
    }
}

/// Cast to String per spec: array join by ',', numbers in shortest round-tripping form.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr.iter().map(to_display_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => String::new(),
    }
}

/// Cast to Bool per spec: objects are always truthy, everything else follows `js_truthy`.
pub fn to_bool(value: &Value) -> bool {
    js_truthy(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_numbers_across_representations() {
        assert!(js_equal(&json!(45), &json!(45.0)));
        assert!(js_equal(&json!(1_u64), &json!(1_i64)));
    }

    #[test]
    fn cross_type_is_unequal() {
        assert!(!js_equal(&json!(1), &json!("1")));
        assert!(!js_equal(&json!(true), &json!(1)));
    }

    #[test]
    fn array_cast_to_number() {
        assert_eq!(to_number(&json!([])), Some(0.0));
        assert_eq!(to_number(&json!(["42"])), Some(42.0));
        assert_eq!(to_number(&json!([1, 2])), None);
    }

    #[test]
    fn string_cast_to_number() {
        assert_eq!(to_number(&json!("  12.5 ")), Some(12.5));
        assert_eq!(to_number(&json!("")), Some(0.0));
        assert_eq!(to_number(&json!("nope")), None);
    }

    #[test]
    fn truthy_rules() {
        assert!(!js_truthy(&json!(null)));
        assert!(!js_truthy(&json!(false)));
        assert!(!js_truthy(&json!(0)));
        assert!(!js_truthy(&json!("")));
        assert!(js_truthy(&json!({})));
        assert!(js_truthy(&json!([])));
    }
}
