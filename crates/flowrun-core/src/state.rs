//! Run state: a flat JSON object shared by every node of a run.
//!
//! Tools receive a snapshot of the whole state and return a partial state,
//! which the engine merges back shallowly (top-level keys only).

use serde_json::Value;

/// Mapping of arbitrary keys to JSON values.
pub type State = serde_json::Map<String, Value>;

/// Truthiness of a state value.
///
/// `null`, `false`, numeric zero, the empty string, the empty array and the
/// empty object are falsy. Everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Whether `key` is present in `state` with a truthy value.
pub fn key_is_truthy(state: &State, key: &str) -> bool {
    state.get(key).is_some_and(is_truthy)
}

/// Shallow merge: every top-level key of `partial` overwrites `state`.
pub fn merge(state: &mut State, partial: &State) {
    for (k, v) in partial {
        state.insert(k.clone(), v.clone());
    }
}

/// Build a state from a JSON value. Non-objects yield `None`.
pub fn from_value(value: Value) -> Option<State> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
