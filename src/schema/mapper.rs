//! Document mapper: converts between JSON documents and path-keyed typed
//! value mappings.
//!
//! The mapping is total: every scalar, object and array node reachable
//! through property paths gets exactly one entry. Object and array nodes
//! are emitted as canonical minified JSON under their own path; objects
//! additionally recurse into their properties under camelCased segments.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{DataKeepError, DataKeepResult};
use crate::schema::DataType;

/// One entry of a mapped document: a `/`-delimited path, the literal value
/// rendered as a string, and the inferred type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedValue {
    pub path: String,
    pub value: String,
    pub data_type: DataType,
}

/// Flattens a document into path-keyed typed values rooted at `base_path`.
///
/// Idempotent on canonical input: mapping the document reconstructed by
/// [`unmap`] yields the same entries.
pub fn map(document: &Value, base_path: &str) -> Vec<MappedValue> {
    let mut entries = Vec::new();
    walk(document, base_path, &mut entries);
    entries
}

fn walk(value: &Value, path: &str, out: &mut Vec<MappedValue>) {
    match value {
        Value::Object(properties) => {
            out.push(MappedValue {
                path: path.to_string(),
                value: canonical_json(value),
                data_type: DataType::Object,
            });
            for (name, child) in properties {
                let child_path = format!("{}/{}", path, camel_case(name));
                walk(child, &child_path, out);
            }
        }
        Value::Array(_) => out.push(MappedValue {
            path: path.to_string(),
            value: canonical_json(value),
            data_type: DataType::Array,
        }),
        Value::String(s) => out.push(MappedValue {
            path: path.to_string(),
            value: s.clone(),
            data_type: DataType::String,
        }),
        // serde_json renders numbers locale-independently, so the literal
        // round-trips without a separate invariant formatter.
        Value::Number(n) => out.push(MappedValue {
            path: path.to_string(),
            value: n.to_string(),
            data_type: DataType::Number,
        }),
        Value::Bool(b) => out.push(MappedValue {
            path: path.to_string(),
            value: b.to_string(),
            data_type: DataType::Boolean,
        }),
        Value::Null => out.push(MappedValue {
            path: path.to_string(),
            value: "null".to_string(),
            data_type: DataType::Null,
        }),
    }
}

/// Rebuilds a document from mapped entries rooted at `base_path`.
///
/// When `declared` paths are given, unknown paths are kept only if
/// `allow_undeclared` is set; otherwise they are dropped silently.
pub fn unmap(
    entries: &[MappedValue],
    base_path: &str,
    declared: Option<&HashSet<String>>,
    allow_undeclared: bool,
) -> DataKeepResult<Value> {
    // A scalar or array root reconstructs directly from its own entry.
    if let Some(root) = entries.iter().find(|e| e.path == base_path) {
        if root.data_type != DataType::Object {
            return parse_entry(root);
        }
    }

    let prefix = format!("{}/", base_path);
    let mut document = Map::new();
    for entry in entries {
        let rel = match entry.path.strip_prefix(&prefix) {
            Some(rel) if !rel.is_empty() => rel,
            _ => continue,
        };
        // Container objects are rebuilt from their children; only childless
        // ones (empty objects) insert their serialized form.
        if entry.data_type == DataType::Object && has_children(entries, &entry.path) {
            continue;
        }
        if let Some(declared) = declared {
            if !declared.contains(rel) && !allow_undeclared {
                continue;
            }
        }
        insert_at(&mut document, rel, parse_entry(entry)?)?;
    }
    Ok(Value::Object(document))
}

fn has_children(entries: &[MappedValue], path: &str) -> bool {
    let prefix = format!("{}/", path);
    entries.iter().any(|e| e.path.starts_with(&prefix))
}

fn parse_entry(entry: &MappedValue) -> DataKeepResult<Value> {
    Ok(match entry.data_type {
        DataType::String => Value::String(entry.value.clone()),
        DataType::Boolean => Value::Bool(entry.value == "true"),
        DataType::Null => Value::Null,
        DataType::Number => serde_json::from_str(&entry.value).map_err(|_| {
            DataKeepError::SchemaViolation(format!(
                "Invalid number literal '{}' at '{}'",
                entry.value, entry.path
            ))
        })?,
        DataType::Object | DataType::Array => serde_json::from_str(&entry.value).map_err(|_| {
            DataKeepError::SchemaViolation(format!(
                "Invalid JSON literal at '{}'",
                entry.path
            ))
        })?,
    })
}

fn insert_at(document: &mut Map<String, Value>, rel: &str, value: Value) -> DataKeepResult<()> {
    let mut segments: Vec<&str> = rel.split('/').collect();
    let last = match segments.pop() {
        Some(last) => last,
        None => return Ok(()),
    };
    let mut current = document;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = slot.as_object_mut().ok_or_else(|| {
            DataKeepError::SchemaViolation(format!(
                "Path '{}' descends through a non-object value",
                rel
            ))
        })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Canonical form of a document: object keys camelCased recursively.
/// Serializing this form yields the minified JSON the mapper stores for
/// object and array nodes.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(properties) => Value::Object(
            properties
                .iter()
                .map(|(name, child)| (camel_case(name), canonicalize(child)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// Lowercases the leading character, matching the wire JSON convention
/// used for property names throughout the system.
pub fn camel_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
