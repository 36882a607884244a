//! Patch application and tree projections.

use serde_json::{Map, Value};

use super::{Delta, StateTree, is_private_key};

/// Apply `delta` to `target` in place.
///
/// For each key: `null` deletes it, an object recurses (replacing a missing
/// or non-object value with an empty object first), anything else
/// overwrites. Private keys in a delta are ignored.
pub fn apply(target: &mut StateTree, delta: &Delta) {
    for (key, value) in delta {
        if is_private_key(key) {
            continue;
        }

        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(inner) = slot {
                    apply(inner, nested);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Deep-clone a tree without its private keys.
pub fn clone_public(tree: &StateTree) -> StateTree {
    tree.iter()
        .filter(|(key, _)| !is_private_key(key))
        .map(|(key, value)| (key.clone(), clone_public_value(value)))
        .collect()
}

/// Deep-clone a value, dropping private keys from every object inside it,
/// including objects nested in arrays.
pub fn clone_public_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(clone_public(map)),
        Value::Array(items) => Value::Array(items.iter().map(clone_public_value).collect()),
        other => other.clone(),
    }
}

/// Build the patch that resets every leaf path of `shape` to its value in
/// `source`.
///
/// Paths absent from `source` become `null`. Where `source` holds a
/// non-object at a path `shape` descends into, the whole `source` value is
/// emitted. Applying the result to a tree that was patched with `shape`
/// undoes that patch relative to `source`.
pub fn restrict(source: &StateTree, shape: &Delta) -> Delta {
    let mut out = Map::new();

    for (key, value) in shape {
        let restored = match (value, source.get(key)) {
            (Value::Object(nested), Some(Value::Object(inner))) => {
                Value::Object(restrict(inner, nested))
            }
            (_, Some(existing)) => clone_public_value(existing),
            (_, None) => Value::Null,
        };
        out.insert(key.clone(), restored);
    }

    out
}

/// Look up a value by key path, one segment per nesting level.
pub fn get_path<'a>(tree: &'a StateTree, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = tree.get(*first)?;
    if rest.is_empty() {
        return Some(value);
    }
    match value {
        Value::Object(inner) => get_path(inner, rest),
        _ => None,
    }
}
