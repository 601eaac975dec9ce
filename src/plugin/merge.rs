//! Pure functions combining per-plugin contributions into shared documents,
//! and taking them back out again.
//!
//! Documents are top-level JSON objects. Nothing here touches the filesystem.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{Map, Value};

use crate::model::platform::McpKey;

/// Deep-merges `overlay` into `base`.
///
/// Objects union their keys and recurse, arrays merge with de-duplication,
/// anything else takes the overlay value.
pub fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => Value::Object(merge_objects(base, overlay)),
        (Value::Array(base), Value::Array(overlay)) => Value::Array(merge_arrays(base, overlay)),
        (_, overlay) => overlay.clone(),
    }
}

pub fn merge_objects(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match merged.get(key) {
            Some(existing) => merge_values(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Base then overlay, keeping the first occurrence of each value.
pub fn merge_arrays(base: &[Value], overlay: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    base.iter()
        .chain(overlay)
        .filter(|value| seen.insert(dedup_key(value)))
        .cloned()
        .collect()
}

pub fn merge_string_lists(base: &[String], overlay: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    base.iter()
        .chain(overlay)
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}

/// Strings compare by their text, everything else by its JSON form.
fn dedup_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Overlay servers replace same-named base servers in place; new ones are appended.
pub fn merge_server_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (name, config) in overlay {
        merged.insert(name.clone(), config.clone());
    }
    merged
}

/// Merges `{id, ...}` input records by `id`.
///
/// A matching overlay record replaces the base record at the base's position;
/// the rest are appended in overlay order.
pub fn merge_inputs(base: &[Value], overlay: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = base.to_vec();
    for record in overlay {
        let position = input_id(record).and_then(|id| {
            merged
                .iter()
                .position(|existing| input_id(existing) == Some(id))
        });
        match position {
            Some(index) => merged[index] = record.clone(),
            None => merged.push(record.clone()),
        }
    }
    merged
}

fn input_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Adds a plugin's servers (and inputs) to an MCP document.
pub fn merge_mcp(
    doc: &Map<String, Value>,
    key: McpKey,
    servers: &Map<String, Value>,
    inputs: &[Value],
) -> Map<String, Value> {
    let mut merged = doc.clone();

    let existing = doc
        .get(key.as_str())
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    if !servers.is_empty() || doc.contains_key(key.as_str()) {
        merged.insert(
            key.as_str().to_string(),
            Value::Object(merge_server_maps(&existing, servers)),
        );
    }

    if !inputs.is_empty() {
        let existing: &[Value] = doc
            .get("inputs")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        merged.insert("inputs".to_string(), Value::Array(merge_inputs(existing, inputs)));
    }

    merged
}

/// Removes the named servers from every server grouping in an MCP document.
///
/// Emptied groupings are dropped, as are `inputs` records no remaining server
/// refers to via `${input:<id>}`.
pub fn remove_mcp_servers(doc: &Map<String, Value>, names: &BTreeSet<String>) -> Map<String, Value> {
    if names.is_empty() {
        return doc.clone();
    }

    let mut removed_any = false;
    let mut result = Map::new();
    for (key, value) in doc {
        let is_grouping = McpKey::all().iter().any(|k| k.as_str() == key);
        match value {
            Value::Object(servers) if is_grouping => {
                let kept: Map<String, Value> = servers
                    .iter()
                    .filter(|(name, _)| !names.contains(name.as_str()))
                    .map(|(name, config)| (name.clone(), config.clone()))
                    .collect();
                removed_any |= kept.len() != servers.len();
                if !kept.is_empty() {
                    result.insert(key.clone(), Value::Object(kept));
                }
            }
            other => {
                result.insert(key.clone(), other.clone());
            }
        }
    }

    if removed_any {
        prune_unreferenced_inputs(&mut result);
    }
    result
}

fn prune_unreferenced_inputs(doc: &mut Map<String, Value>) {
    let Some(inputs) = doc.get("inputs").and_then(Value::as_array) else {
        return;
    };

    let referenced: String = McpKey::all()
        .iter()
        .filter_map(|key| doc.get(key.as_str()))
        .map(Value::to_string)
        .collect();

    let kept: Vec<Value> = inputs
        .iter()
        .filter(|record| {
            input_id(record).is_some_and(|id| referenced.contains(&format!("${{input:{id}}}")))
        })
        .cloned()
        .collect();

    if kept.is_empty() {
        *doc = doc
            .iter()
            .filter(|(key, _)| key.as_str() != "inputs")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
    } else {
        doc.insert("inputs".to_string(), Value::Array(kept));
    }
}

/// Appends permission values per key, skipping ones already present.
pub fn merge_settings(
    doc: &Map<String, Value>,
    values: &BTreeMap<String, Vec<String>>,
) -> Map<String, Value> {
    let overlay: Map<String, Value> = values
        .iter()
        .filter(|(_, list)| !list.is_empty())
        .map(|(key, list)| {
            let items = list.iter().cloned().map(Value::String).collect();
            (key.clone(), Value::Array(items))
        })
        .collect();
    merge_objects(doc, &overlay)
}

/// Removes values from one settings array; the key goes away once the array is empty.
pub fn remove_settings_values(
    doc: &Map<String, Value>,
    key: &str,
    values: &BTreeSet<String>,
) -> Map<String, Value> {
    let Some(Value::Array(items)) = doc.get(key) else {
        return doc.clone();
    };

    let kept: Vec<Value> = items
        .iter()
        .filter(|item| !item.as_str().is_some_and(|text| values.contains(text)))
        .cloned()
        .collect();

    doc.iter()
        .filter_map(|(name, value)| {
            if name != key {
                return Some((name.clone(), value.clone()));
            }
            (!kept.is_empty()).then(|| (name.clone(), Value::Array(kept.clone())))
        })
        .collect()
}
