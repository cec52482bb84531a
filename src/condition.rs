use log::warn;
use regex::Regex;
use serde_json::Value;

use crate::model::{Attributes, Condition, SavedGroupsMap};
use crate::value;

/// Evaluate a condition against a bag of attributes and the catalog's saved
/// groups. `$and` short-circuits on the first false, `$or` on the first
/// true (an empty `$or` is true), `$nor` inverts `$or`, `$not` inverts its
/// single inner condition.
pub fn eval_condition(attributes: &Attributes, condition: &Condition, saved_groups: &SavedGroupsMap) -> bool {
    if let Some(or_condition) = condition.get("$or") {
        return eval_or(attributes, or_condition, saved_groups);
    }

    if let Some(nor_condition) = condition.get("$nor") {
        return !eval_or(attributes, nor_condition, saved_groups);
    }

    if let Some(and_condition) = condition.get("$and") {
        return eval_and(attributes, and_condition, saved_groups);
    }

    if let Some(not_condition) = condition.get("$not") {
        return !eval_condition(attributes, not_condition, saved_groups);
    }

    if let Some(obj) = condition.as_object() {
        for (key, value) in obj.iter() {
            let attribute_value = get_path(attributes, key);
            if !eval_condition_value(value, attribute_value, saved_groups) {
                return false;
            }
        }
    }

    true
}

fn eval_or(attributes: &Attributes, conditions: &Condition, saved_groups: &SavedGroupsMap) -> bool {
    if let Some(array) = conditions.as_array() {
        array.is_empty() || array.iter().any(|condition| eval_condition(attributes, condition, saved_groups))
    } else {
        true
    }
}

fn eval_and(attributes: &Attributes, conditions: &Condition, saved_groups: &SavedGroupsMap) -> bool {
    if let Some(array) = conditions.as_array() {
        array.iter().all(|condition| eval_condition(attributes, condition, saved_groups))
    } else {
        false
    }
}

fn eval_condition_value(condition_value: &Value, attribute_value: Option<&Value>, saved_groups: &SavedGroupsMap) -> bool {
    if let Some(obj) = condition_value.as_object() {
        if is_operator_object(condition_value) {
            return obj.iter().all(|(key, value)| eval_operator_condition(key, attribute_value, value, saved_groups));
        }
    }

    attribute_value.map_or(condition_value.is_null(), |value| value::js_equal(value, condition_value))
}

fn is_operator_object(obj: &Value) -> bool {
    if let Some(obj) = obj.as_object() {
        return !obj.is_empty() && obj.keys().all(|key| key.starts_with('$'));
    }
    false
}

fn get_path<'a>(attributes: &'a Attributes, key: &'a str) -> Option<&'a Value> {
    let fields: Vec<&str> = key.split('.').collect();
    let mut current_value = attributes;

    for field in fields {
        if let Some(next_value) = current_value.get(field) {
            current_value = next_value;
        } else {
            return None;
        }
    }

    Some(current_value)
}

fn elem_match(condition_value: &Value, attribute_value: Option<&Value>, saved_groups: &SavedGroupsMap) -> bool {
    if let Some(attribute_array) = attribute_value.and_then(Value::as_array) {
        attribute_array.iter().any(|attribute| {
            if is_operator_object(condition_value) {
                eval_condition_value(condition_value, Some(attribute), saved_groups)
            } else {
                eval_condition(attribute, condition_value, saved_groups)
            }
        })
    } else {
        false
    }
}

pub(crate) fn padded_version_string(input: Option<&str>) -> String {
    if let Some(input) = input {
        let re = match Regex::new(r"(^v|\+.*$)") {
            Ok(regex) => regex,
            Err(err) => {
                warn!("error creating version-stripping regex: {}", err);
                return String::new();
            }
        };
        let without_prefix = re.replace_all(input, "").to_string();

        let mut parts: Vec<&str> = without_prefix.split(['-', '.']).filter(|s| !s.is_empty()).collect();
        if parts.len() == 3 {
            parts.push("~");
        }

        let padded_parts: Vec<String> = parts
            .iter()
            .map(|&part| {
                if !part.is_empty() && part.chars().all(char::is_numeric) {
                    format!("{:0>5}", part)
                } else {
                    part.to_string()
                }
            })
            .filter(|s| !s.is_empty())
            .collect();

        padded_parts.join("-")
    } else {
        String::new()
    }
}

fn is_in(condition_value: &Value, attribute_value: Option<&Value>) -> bool {
    if let Some(attribute_value) = attribute_value {
        let cond_array = condition_value.as_array().map(Vec::as_slice).unwrap_or(&[]);
        if let Some(attr_array) = attribute_value.as_array() {
            attr_array.iter().any(|value| cond_array.iter().any(|c| value::js_equal(c, value)))
        } else {
            cond_array.iter().any(|c| value::js_equal(c, attribute_value))
        }
    } else {
        false
    }
}

fn in_saved_group(attribute_value: Option<&Value>, group_name: &str, saved_groups: &SavedGroupsMap) -> bool {
    let Some(attribute_value) = attribute_value else { return false };
    saved_groups
        .get(group_name)
        .map(|group| group.iter().any(|member| value::js_equal(member, attribute_value)))
        .unwrap_or(false)
}

pub(crate) fn compare_values(attribute_value: Option<&Value>, condition_value: &Value, operator: &str) -> bool {
    if let Some(attribute_value) = attribute_value {
        match (attribute_value, condition_value) {
            (Value::Number(num1), Value::Number(num2)) => {
                if let (Some(num1), Some(num2)) = (num1.as_f64(), num2.as_f64()) {
                    match operator {
                        ">=" => num1 >= num2,
                        "<=" => num1 <= num2,
                        ">" => num1 > num2,
                        "<" => num1 < num2,
                        "==" => num1 == num2,
                        "!=" => num1 != num2,
                        _ => false,
                    }
                } else {
                    false
                }
            }
            (Value::String(str1), Value::String(str2)) => {
                let str1 = str1.as_str();
                let str2 = str2.as_str();
                match operator {
                    ">=" => str1 >= str2,
                    "<=" => str1 <= str2,
                    ">" => str1 > str2,
                    "<" => str1 < str2,
                    "==" => str1 == str2,
                    "!=" => str1 != str2,
                    _ => false,
                }
            }
            _ if operator == "==" => value::js_equal(attribute_value, condition_value),
            _ if operator == "!=" => !value::js_equal(attribute_value, condition_value),
            _ => {
                warn!(
                    "condition operator '{}' compares mismatched types ({} vs {})",
                    operator,
                    value::js_typeof(Some(attribute_value)),
                    value::js_typeof(Some(condition_value))
                );
                false
            }
        }
    } else {
        false
    }
}

pub(crate) fn eval_operator_condition(
    operator: &str,
    attribute_value: Option<&Value>,
    condition_value: &Value,
    saved_groups: &SavedGroupsMap,
) -> bool {
    match operator {
        "$eq" => compare_values(attribute_value, condition_value, "=="),
        "$ne" => compare_values(attribute_value, condition_value, "!="),
        "$gt" => compare_values(attribute_value, condition_value, ">"),
        "$gte" => compare_values(attribute_value, condition_value, ">="),
        "$lt" => compare_values(attribute_value, condition_value, "<"),
        "$lte" => compare_values(attribute_value, condition_value, "<="),
        "$regex" => {
            let pattern = match Regex::new(condition_value.as_str().unwrap_or("")) {
                Ok(regex) => regex,
                Err(_err) => return false,
            };
            attribute_value.and_then(Value::as_str).map(|attr| pattern.is_match(attr)).unwrap_or(false)
        }
        "$in" => {
            if !condition_value.is_array() {
                return false;
            }
            is_in(condition_value, attribute_value)
        }
        "$nin" => {
            if !condition_value.is_array() {
                return false;
            }
            !is_in(condition_value, attribute_value)
        }
        "$all" => {
            if let (Some(attribute_value), Some(condition_value)) = (attribute_value.and_then(Value::as_array), condition_value.as_array()) {
                condition_value
                    .iter()
                    .all(|condition| attribute_value.iter().any(|attribute| eval_condition_value(condition, Some(attribute), saved_groups)))
            } else {
                false
            }
        }
        "$elemMatch" => elem_match(condition_value, attribute_value, saved_groups),
        "$size" => {
            if let Some(attribute_value) = attribute_value.and_then(Value::as_array) {
                eval_condition_value(condition_value, Some(&Value::from(attribute_value.len())), saved_groups)
            } else {
                false
            }
        }
        "$exists" => attribute_value.map_or(false, |attr| !attr.is_null()) == condition_value.as_bool().unwrap_or(false),
        "$type" => value::js_typeof(attribute_value) == condition_value.as_str().unwrap_or(""),
        "$not" => !eval_condition_value(condition_value, attribute_value, saved_groups),
        "$veq" => padded_version_string(attribute_value.and_then(Value::as_str)) == padded_version_string(condition_value.as_str()),
        "$vne" => padded_version_string(attribute_value.and_then(Value::as_str)) != padded_version_string(condition_value.as_str()),
        "$vgt" => padded_version_string(attribute_value.and_then(Value::as_str)) > padded_version_string(condition_value.as_str()),
        "$vgte" => padded_version_string(attribute_value.and_then(Value::as_str)) >= padded_version_string(condition_value.as_str()),
        "$vlt" => padded_version_string(attribute_value.and_then(Value::as_str)) < padded_version_string(condition_value.as_str()),
        "$vlte" => padded_version_string(attribute_value.and_then(Value::as_str)) <= padded_version_string(condition_value.as_str()),
        "$inGroup" => in_saved_group(attribute_value, condition_value.as_str().unwrap_or(""), saved_groups),
        "$notInGroup" => !in_saved_group(attribute_value, condition_value.as_str().unwrap_or(""), saved_groups),
        _ => false,
    }
}
