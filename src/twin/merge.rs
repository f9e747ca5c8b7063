//! Structural diff and merge over twin property documents
//!
//! Merge follows the twin patch rules: `null` removes a key, nested objects
//! merge recursively, everything else (arrays included) is replaced
//! wholesale. Diff produces the minimal patch whose merge turns one document
//! into another, recording vanished keys as `null`. `$`-prefixed keys are
//! bookkeeping (`$version`, `$metadata`) and are never diffed; callers assign
//! versions themselves.

use crate::twin::model::METADATA_KEY;
use serde_json::{Map, Value};

/// Merge `patch` into `base` in place.
pub fn merge(base: &mut Value, patch: &Value) {
    merge_values(base, patch);
    prune_metadata(base);
}

/// Minimal patch `p` such that `merge(a, p)` equals `b` modulo metadata.
/// Returns an empty object when the documents already agree.
pub fn diff(a: &Value, b: &Value) -> Value {
    match (a.as_object(), b.as_object()) {
        (Some(a_obj), Some(b_obj)) => {
            let mut patch = Map::new();
            for (key, b_value) in b_obj {
                if key.starts_with('$') {
                    continue;
                }
                match a_obj.get(key) {
                    Some(a_value) if a_value.is_object() && b_value.is_object() => {
                        let child = diff(a_value, b_value);
                        if !is_empty_object(&child) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    Some(a_value) => {
                        if a_value != b_value {
                            patch.insert(key.clone(), b_value.clone());
                        }
                    }
                    None => {
                        patch.insert(key.clone(), b_value.clone());
                    }
                }
            }
            for key in a_obj.keys() {
                if !key.starts_with('$') && !b_obj.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => b.clone(),
    }
}

/// True when `patch` carries no property changes
pub fn is_empty_patch(patch: &Value) -> bool {
    match patch.as_object() {
        Some(obj) => obj.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

fn merge_values(base: &mut Value, patch: &Value) {
    let Some(patch_obj) = patch.as_object() else {
        *base = patch.clone();
        return;
    };
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let base_obj = base.as_object_mut().unwrap();

    for (key, patch_value) in patch_obj {
        if patch_value.is_null() {
            base_obj.remove(key);
            continue;
        }
        let both_objects =
            patch_value.is_object() && base_obj.get(key).map(Value::is_object).unwrap_or(false);
        if both_objects {
            merge_values(base_obj.get_mut(key).unwrap(), patch_value);
        } else {
            base_obj.insert(key.clone(), strip_nulls(patch_value));
        }
    }
}

// A patch subtree landing on empty ground may still carry removal markers;
// they must not be stored as literal nulls.
fn strip_nulls(value: &Value) -> Value {
    match value.as_object() {
        Some(obj) => {
            let mut out = Map::new();
            for (key, child) in obj {
                if !child.is_null() {
                    out.insert(key.clone(), strip_nulls(child));
                }
            }
            Value::Object(out)
        }
        None => value.clone(),
    }
}

// Drop `$metadata` mirror entries whose property no longer exists.
fn prune_metadata(doc: &mut Value) {
    let Some(obj) = doc.as_object_mut() else {
        return;
    };
    if let Some(mut meta) = obj.remove(METADATA_KEY) {
        if let Some(meta_obj) = meta.as_object_mut() {
            prune_level(obj, meta_obj);
        }
        obj.insert(METADATA_KEY.to_string(), meta);
    }
}

fn prune_level(properties: &Map<String, Value>, metadata: &mut Map<String, Value>) {
    let stale: Vec<String> = metadata
        .keys()
        .filter(|k| !k.starts_with('$') && !properties.contains_key(*k))
        .cloned()
        .collect();
    for key in stale {
        metadata.remove(&key);
    }
    for (key, meta_child) in metadata.iter_mut() {
        if key.starts_with('$') {
            continue;
        }
        if let (Some(Value::Object(prop_child)), Some(meta_obj)) =
            (properties.get(key), meta_child.as_object_mut())
        {
            prune_level(prop_child, meta_obj);
        }
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(false)
}
