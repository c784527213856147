//! Canonical hashing for resource values.
//!
//! Every convergence decision in the framework is a hash comparison, never a
//! structural deep-compare, so the digests here must be reproducible:
//! the same value always hashes to the same digest, independent of field
//! insertion order.
//!
//! Two digests exist per resource:
//!
//! - the **target hash** covers only the target-field subset of the value
//!   (the orchestrator-managed surface);
//! - the **full hash** covers every field.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Field separator inside the target-hash fold.
const FIELD_SEP: u8 = 0xfe;

/// Tag bytes distinguishing a present field from an absent one.
///
/// An absent target field must hash differently from `null`, `""` or `0` so
/// that "field removed" and "field set to default" stay distinguishable.
const PRESENT: u8 = 1;
const ABSENT: u8 = 0;

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => canonical_json_object(map),
        Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

fn canonical_json_object(map: &Map<String, Value>) -> String {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort_by_key(|(k, _)| *k);
    let inner: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
        .collect();
    format!("{{{}}}", inner.join(","))
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Digest over every field of a value.
pub fn full_hash(value: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json_object(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest over the target-field subset of a value.
///
/// Fields are folded in ascending name order. A field listed in
/// `target_fields` but missing from the value contributes an explicit
/// absent tag to the digest.
pub fn target_hash(value: &Map<String, Value>, target_fields: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for field in target_fields {
        hasher.update(field.as_bytes());
        hasher.update([FIELD_SEP]);
        match value.get(field) {
            Some(v) => {
                hasher.update([PRESENT]);
                hasher.update(canonical_json(v).as_bytes());
            }
            None => hasher.update([ABSENT]),
        }
        hasher.update([FIELD_SEP]);
    }
    hex::encode(hasher.finalize())
}
