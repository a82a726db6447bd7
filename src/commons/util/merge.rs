//! Deep merging of JSON documents.
//!
//! Every producer of connector configuration contributes a fragment. The
//! fragments are folded into one accumulated document, where a later
//! fragment wins for scalar and array values, and nested objects are merged
//! key by key.

use serde_json::Value;

/// Merges `fragment` into `target`.
pub fn deep_merge(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target), Value::Object(fragment)) => {
            for (key, value) in fragment {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, fragment) => *target = fragment.clone(),
    }
}

//------------ Tests ---------------------------------------------------------
