//! Snapshot diffing.

use serde_json::{Map, Value};

use super::{Delta, StateTree, clone_public_value, is_private_key};

/// Compute the delta `D` such that `apply(previous, D)` yields the public
/// shape of `current`.
///
/// - unchanged leaves are omitted
/// - keys present in `previous` but absent (or `null`) in `current` become `null`
/// - nested objects recurse; arrays are compared and emitted wholesale
/// - private keys are skipped on both sides
///
/// `diff(s, &Map::new())` is the full-state emission of `s`.
pub fn diff(current: &StateTree, previous: &StateTree) -> Delta {
    let mut delta = Map::new();

    for (key, value) in current {
        if is_private_key(key) || value.is_null() {
            continue;
        }

        match (value, previous.get(key)) {
            (Value::Object(cur), Some(Value::Object(prev))) => {
                let nested = diff(cur, prev);
                if !nested.is_empty() {
                    delta.insert(key.clone(), Value::Object(nested));
                }
            }
            (cur, Some(prev)) if cur == prev => {}
            (cur, _) => {
                delta.insert(key.clone(), clone_public_value(cur));
            }
        }
    }

    for (key, value) in previous {
        if is_private_key(key) || value.is_null() {
            continue;
        }
        let removed = current.get(key).is_none_or(Value::is_null);
        if removed {
            delta.insert(key.clone(), Value::Null);
        }
    }

    delta
}
