//! Combining configuration layers
//!
//! A later layer only has to name what it changes: tables are combined key
//! by key, so an `isolated-compile.toml` holding just `compile.worker_count`
//! keeps every other `[compile]` default. Lists such as `compile.confs` or
//! `classpath.extra` are taken whole from the later layer; a file that sets
//! `confs = ["runtime"]` gets exactly that list.

use serde_json::Value;

/// Overlay `overlay` onto `base` and return the result.
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

fn merge_into(slot: &mut Value, overlay: Value) {
    match (slot, overlay) {
        (Value::Object(table), Value::Object(overlay_table)) => {
            for (key, value) in overlay_table {
                match table.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        table.insert(key, value);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// Merge layers lowest precedence first (builtin, file, CLI).
pub fn merge_layers(layers: Vec<Value>) -> Value {
    let mut merged = Value::Null;
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}
