//! Conversions between API JSON and attribute values

use std::collections::HashMap;

use osc_core::resource::Value;
use serde_json::{Value as JsonValue, json};

/// Convert JSON value to attribute Value; `null` has no counterpart
///
/// Numbers that do not fit an `i64` (fractions, huge unsigned values) keep their
/// decimal text rather than being truncated.
pub fn json_to_value(value: &JsonValue) -> Option<Value> {
    match value {
        JsonValue::String(s) => Some(Value::String(s.clone())),
        JsonValue::Bool(b) => Some(Value::Bool(*b)),
        JsonValue::Number(n) => Some(match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::String(n.to_string()),
        }),
        JsonValue::Array(arr) => {
            let items: Vec<Value> = arr.iter().filter_map(json_to_value).collect();
            Some(Value::List(items))
        }
        JsonValue::Object(obj) => {
            let map: HashMap<String, Value> = obj
                .iter()
                .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
                .collect();
            Some(Value::Map(map))
        }
        JsonValue::Null => None,
    }
}

/// Convert attribute Value to JSON value
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::String(s) => json!(s),
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::List(items) => JsonValue::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// Copy `json[field]` into `attributes[name]` when present
pub fn copy_field(
    attributes: &mut HashMap<String, Value>,
    name: &str,
    json: &JsonValue,
    field: &str,
) {
    if let Some(value) = json.get(field).and_then(json_to_value) {
        attributes.insert(name.to_string(), value);
    }
}

/// Set `request[field]` from an optional attribute
pub fn put_field(request: &mut JsonValue, field: &str, value: Option<&Value>) {
    if let (Some(value), Some(object)) = (value, request.as_object_mut()) {
        object.insert(field.to_string(), value_to_json(value));
    }
}

pub fn str_field<'a>(json: &'a JsonValue, field: &str) -> Option<&'a str> {
    json.get(field).and_then(|v| v.as_str())
}

/// `[{"GroupId": "sg-1"}, ...]` -> `["sg-1", ...]`
pub fn pluck_strings(json: &JsonValue, list: &str, field: &str) -> Vec<String> {
    json.get(list)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| str_field(item, field).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// `["a", "b"]` -> `["a", "b"]`
pub fn json_strings(json: &JsonValue, list: &str) -> Vec<String> {
    json.get(list)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

pub fn strings_to_value(items: Vec<String>) -> Value {
    Value::List(items.into_iter().map(Value::String).collect())
}

/// `[{"Key": "Name", "Value": "web"}]` -> `{Name = "web"}`
pub fn tags_from_json(json: &JsonValue) -> Value {
    let tags = json
        .get("Tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|tag| {
                    let key = str_field(tag, "Key")?;
                    let value = str_field(tag, "Value").unwrap_or_default();
                    Some((key.to_string(), Value::String(value.to_string())))
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Map(tags)
}

pub fn tags_to_json(pairs: &[(String, String)]) -> JsonValue {
    JsonValue::Array(
        pairs
            .iter()
            .map(|(k, v)| json!({"Key": k, "Value": v}))
            .collect(),
    )
}

/// String entries of a map attribute; missing or mistyped attributes are empty
pub fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    value
        .and_then(Value::as_map)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value.map(Value::string_list).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_objects_become_maps() {
        let value = json_to_value(&json!({"Port": 443, "Protocol": "HTTPS", "Gone": null})).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("Port"), Some(&Value::Int(443)));
        assert!(!map.contains_key("Gone"));
    }

    #[test]
    fn fractional_numbers_are_not_truncated() {
        assert_eq!(json_to_value(&json!(2.5)), Some(Value::String("2.5".to_string())));
        assert_eq!(
            json_to_value(&json!(u64::MAX)),
            Some(Value::String(u64::MAX.to_string()))
        );
        assert_eq!(json_to_value(&json!(-7)), Some(Value::Int(-7)));
    }

    #[test]
    fn tags_convert_both_ways() {
        let response = json!({"Tags": [{"Key": "Name", "Value": "web"}, {"Key": "empty"}]});
        let tags = tags_from_json(&response);
        let map = string_map(Some(&tags));
        assert_eq!(map.get("Name").map(String::as_str), Some("web"));
        assert_eq!(map.get("empty").map(String::as_str), Some(""));

        let json = tags_to_json(&[("env".to_string(), "prod".to_string())]);
        assert_eq!(json, json!([{"Key": "env", "Value": "prod"}]));
    }

    #[test]
    fn put_field_skips_missing_values() {
        let mut request = json!({"SubregionName": "eu-west-2a"});
        put_field(&mut request, "Size", Some(&Value::Int(10)));
        put_field(&mut request, "SnapshotId", None);
        assert_eq!(request, json!({"SubregionName": "eu-west-2a", "Size": 10}));
    }

    #[test]
    fn pluck_nested_ids() {
        let response = json!({"SecurityGroups": [{"GroupId": "sg-1"}, {"GroupName": "x"}]});
        assert_eq!(pluck_strings(&response, "SecurityGroups", "GroupId"), vec!["sg-1"]);
        assert!(pluck_strings(&response, "Missing", "GroupId").is_empty());
    }
}
