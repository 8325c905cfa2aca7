//! JSON value helpers shared by the runner and task authors.

use serde_json::{Map, Value};

/// Converts a float into a JSON value, mapping NaN and infinities to `null`.
#[must_use]
pub fn json_safe_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// True for `null` and the empty string.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Drops entries whose value is `null` or `""`.
#[must_use]
pub fn prune_empty(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().filter(|(_, v)| !is_empty_value(v)).collect()
}
