//! Structural deltas between JSON values, in the jsondiffpatch delta format.
//!
//! - `[new]` added, `[old, new]` replaced, `[old, 0, 0]` removed
//! - objects: one delta per changed key
//! - arrays: `{"_t": "a", ...}` with numeric keys for inserts and inner
//!   deltas, `_N` keys for removals and `["", to, 3]` moves
//!
//! Array items that are objects or arrays match by position, so an edit
//! inside the n-th item produces an inner delta rather than a remove and
//! insert pair.

use serde_json::{json, Map, Value};
use thiserror::Error;

const ARRAY_MOVE: u64 = 3;
const TEXT_DIFF: u64 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("expected {expected} but found {found}")]
    Mismatch { expected: String, found: String },

    #[error("invalid delta: {0}")]
    Invalid(String),
}

fn mismatch(expected: &Value, found: Option<&Value>) -> PatchError {
    PatchError::Mismatch {
        expected: expected.to_string(),
        found: found.map_or_else(|| "nothing".to_string(), Value::to_string),
    }
}

/// Delta turning `left` into `right`, or `None` when they are equal.
pub fn diff(left: &Value, right: &Value) -> Option<Value> {
    if left == right {
        return None;
    }
    match (left, right) {
        (Value::Object(a), Value::Object(b)) => diff_objects(a, b),
        (Value::Array(a), Value::Array(b)) => diff_arrays(a, b),
        _ => Some(json!([left, right])),
    }
}

fn diff_objects(left: &Map<String, Value>, right: &Map<String, Value>) -> Option<Value> {
    let mut delta = Map::new();
    for (key, old) in left {
        match right.get(key) {
            Some(new) => {
                if let Some(inner) = diff(old, new) {
                    delta.insert(key.clone(), inner);
                }
            }
            None => {
                delta.insert(key.clone(), json!([old, 0, 0]));
            }
        }
    }
    for (key, new) in right {
        if !left.contains_key(key) {
            delta.insert(key.clone(), json!([new]));
        }
    }
    if delta.is_empty() {
        None
    } else {
        Some(Value::Object(delta))
    }
}

fn matches(left: &[Value], right: &[Value], i: usize, j: usize) -> bool {
    if left[i] == right[j] {
        return true;
    }
    let container = |v: &Value| v.is_object() || v.is_array();
    container(&left[i]) && container(&right[j]) && i == j
}

/// Index pairs of a longest common subsequence under [`matches`].
fn lcs(left: &[Value], right: &[Value]) -> Vec<(usize, usize)> {
    let (n, m) = (left.len(), right.len());
    let mut lengths = vec![vec![0usize; m + 1]; n + 1];
    for i in 0..n {
        for j in 0..m {
            lengths[i + 1][j + 1] = if matches(left, right, i, j) {
                lengths[i][j] + 1
            } else {
                lengths[i][j + 1].max(lengths[i + 1][j])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if matches(left, right, i - 1, j - 1) && lengths[i][j] == lengths[i - 1][j - 1] + 1 {
            pairs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if lengths[i - 1][j] >= lengths[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    pairs
}

fn diff_arrays(left: &[Value], right: &[Value]) -> Option<Value> {
    let (len1, len2) = (left.len(), right.len());
    let mut delta = Map::new();
    let inner = |delta: &mut Map<String, Value>, i: usize, j: usize| {
        if let Some(d) = diff(&left[i], &right[j]) {
            delta.insert(j.to_string(), d);
        }
    };

    let mut head = 0;
    while head < len1 && head < len2 && matches(left, right, head, head) {
        inner(&mut delta, head, head);
        head += 1;
    }
    let mut tail = 0;
    while head + tail < len1 && head + tail < len2 && matches(left, right, len1 - 1 - tail, len2 - 1 - tail) {
        inner(&mut delta, len1 - 1 - tail, len2 - 1 - tail);
        tail += 1;
    }

    if head + tail == len1 {
        for index in head..len2 - tail {
            delta.insert(index.to_string(), json!([right[index]]));
        }
    } else if head + tail == len2 {
        for index in head..len1 - tail {
            delta.insert(format!("_{index}"), json!([left[index], 0, 0]));
        }
    } else {
        let trimmed1 = &left[head..len1 - tail];
        let trimmed2 = &right[head..len2 - tail];
        let common = lcs(trimmed1, trimmed2);

        let mut removed = Vec::new();
        for index in head..len1 - tail {
            if !common.iter().any(|&(i, _)| i == index - head) {
                delta.insert(format!("_{index}"), json!([left[index], 0, 0]));
                removed.push(index);
            }
        }
        for index in head..len2 - tail {
            match common.iter().find(|&&(_, j)| j == index - head) {
                Some(&(i, _)) => inner(&mut delta, i + head, index),
                None => {
                    let moved = removed
                        .iter()
                        .position(|&from| matches(trimmed1, trimmed2, from - head, index - head));
                    match moved {
                        Some(position) => {
                            let from = removed.remove(position);
                            delta.insert(format!("_{from}"), json!(["", index, ARRAY_MOVE]));
                            inner(&mut delta, from, index);
                        }
                        None => {
                            delta.insert(index.to_string(), json!([right[index]]));
                        }
                    }
                }
            }
        }
    }

    if delta.is_empty() {
        None
    } else {
        delta.insert("_t".into(), json!("a"));
        Some(Value::Object(delta))
    }
}

/// Apply `delta` to `current`, where `None` stands for an absent value.
///
/// Without `override_`, the old side of every replacement and removal must
/// equal the value found, and additions must land on absent values.
pub fn apply(current: Option<&Value>, delta: &Value, override_: bool) -> Result<Option<Value>, PatchError> {
    match delta {
        Value::Null => Ok(current.cloned()),
        Value::Array(parts) => apply_leaf(current, parts, override_),
        Value::Object(fields) if fields.get("_t") == Some(&json!("a")) => {
            apply_array(current, fields, override_).map(|items| Some(Value::Array(items)))
        }
        Value::Object(fields) => {
            let mut result = match current {
                Some(Value::Object(object)) => object.clone(),
                _ => Map::new(),
            };
            for (key, inner) in fields {
                match apply(result.get(key), inner, override_)? {
                    Some(value) => {
                        result.insert(key.clone(), value);
                    }
                    None => {
                        result.remove(key);
                    }
                }
            }
            Ok(Some(Value::Object(result)))
        }
        other => Err(PatchError::Invalid(format!("unexpected delta {other}"))),
    }
}

fn apply_leaf(current: Option<&Value>, parts: &[Value], override_: bool) -> Result<Option<Value>, PatchError> {
    match parts {
        [new] => {
            if !override_ && current.is_some() {
                return Err(PatchError::Mismatch {
                    expected: "nothing".into(),
                    found: current.map(Value::to_string).unwrap_or_default(),
                });
            }
            Ok(Some(new.clone()))
        }
        [old, new] => {
            if !override_ && current != Some(old) {
                return Err(mismatch(old, current));
            }
            Ok(Some(new.clone()))
        }
        [old, _, kind] => match kind.as_u64() {
            Some(0) => {
                if !override_ && current != Some(old) {
                    return Err(mismatch(old, current));
                }
                Ok(None)
            }
            Some(TEXT_DIFF) => Err(PatchError::Invalid("text deltas are not supported".into())),
            _ => Err(PatchError::Invalid(format!("unknown delta kind {kind}"))),
        },
        _ => Err(PatchError::Invalid(format!("delta of length {}", parts.len()))),
    }
}

fn parse_index(key: &str) -> Result<usize, PatchError> {
    key.parse()
        .map_err(|_| PatchError::Invalid(format!("bad array index '{key}'")))
}

fn apply_array(current: Option<&Value>, fields: &Map<String, Value>, override_: bool) -> Result<Vec<Value>, PatchError> {
    let mut removals = Vec::new();
    let mut inserts = Vec::new();
    let mut modifications = Vec::new();
    for (key, value) in fields {
        if key == "_t" || key == "append" {
            continue;
        }
        if let Some(index) = key.strip_prefix('_') {
            let kind = value.get(2).and_then(Value::as_u64);
            if kind != Some(0) && kind != Some(ARRAY_MOVE) {
                return Err(PatchError::Invalid(format!("bad removal {value}")));
            }
            removals.push((parse_index(index)?, value));
        } else {
            let index = parse_index(key)?;
            match value.as_array().map(Vec::as_slice) {
                Some([item]) => inserts.push((index, item.clone())),
                _ => modifications.push((index, value)),
            }
        }
    }

    let mut result = match current {
        Some(Value::Array(items)) => items.clone(),
        None if !override_ => {
            return Err(PatchError::Mismatch {
                expected: "array".into(),
                found: "nothing".into(),
            })
        }
        _ => Vec::new(),
    };

    removals.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, removal) in removals {
        if index >= result.len() {
            return Err(PatchError::Invalid(format!("removal of missing item {index}")));
        }
        let removed = result.remove(index);
        if removal.get(2).and_then(Value::as_u64) == Some(ARRAY_MOVE) {
            let to = removal
                .get(1)
                .and_then(Value::as_u64)
                .ok_or_else(|| PatchError::Invalid(format!("bad move {removal}")))?;
            inserts.push((to as usize, removed));
        } else if !override_ && removal.get(0) != Some(&removed) {
            return Err(mismatch(&removal[0], Some(&removed)));
        }
    }

    inserts.sort_by_key(|(index, _)| *index);
    for (index, item) in inserts {
        let index = index.min(result.len());
        result.insert(index, item);
    }

    for (index, inner) in modifications {
        while result.len() <= index {
            result.push(Value::Null);
        }
        result[index] = apply(Some(&result[index]), inner, override_)?.unwrap_or(Value::Null);
    }

    if let Some(item) = fields.get("append") {
        result.push(item.clone());
    }
    Ok(result)
}

/// Apply a delta known to have been computed against `current`.
pub fn patch(current: Option<&Value>, delta: &Value) -> Result<Option<Value>, PatchError> {
    apply(current, delta, true)
}
