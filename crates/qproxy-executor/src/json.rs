//! Path-based accessors for `serde_json::Value` payloads.
//!
//! Upstream request/response shapes are mutated structurally (field
//! renames, nested deletes, defaulted inserts) rather than deserialized
//! into typed structs, because unknown fields must pass through untouched.

use serde_json::{Map, Value};

pub(crate) fn get_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

pub(crate) fn get_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_path(value, path).and_then(Value::as_str)
}

/// Sets a nested field, creating intermediate objects as needed. A non-
/// object in the middle of the path is replaced.
pub(crate) fn set_path(value: &mut Value, path: &[&str], new_value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(last.to_string(), new_value);
}

pub(crate) fn delete_path(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        let Some(next) = current.get_mut(segment) else {
            return;
        };
        current = next;
    }
    if let Some(object) = current.as_object_mut() {
        object.remove(*last);
    }
}

/// Renames every occurrence of a key, at any depth, in objects and array
/// elements.
pub(crate) fn rename_keys(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::Object(object) => {
            if let Some(moved) = object.remove(from) {
                object.insert(to.to_string(), moved);
            }
            for (_, child) in object.iter_mut() {
                rename_keys(child, from, to);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rename_keys(item, from, to);
            }
        }
        _ => {}
    }
}
