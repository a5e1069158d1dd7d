//! Partial matching of response bodies against declared expectations
//!
//! Every declared key/value must appear in the actual body; extra keys are
//! ignored. Arrays match as an ordered subsequence unless the step asks for
//! unordered matching, in which case each declared element needs its own
//! distinct actual element.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::suite::ResponseKind;

const MISSING: &str = "<missing>";
const RENDER_LIMIT: usize = 80;

/// First field where the actual body diverges from the expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    /// Path such as `items[0].price`; empty for the body itself
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "body" } else { &self.path };
        write!(f, "{} expected {} got {}", path, self.expected, self.actual)
    }
}

/// Deep partial match of `actual` against `expected`
pub fn partial_match(expected: &Value, actual: &Value, unordered: bool) -> Result<(), FieldMismatch> {
    match_at(expected, Some(actual), "", unordered)
}

fn match_at(
    expected: &Value,
    actual: Option<&Value>,
    path: &str,
    unordered: bool,
) -> Result<(), FieldMismatch> {
    let Some(actual) = actual else {
        return Err(mismatch(path, render(expected), MISSING.to_string()));
    };

    match expected {
        Value::Object(fields) => {
            let Some(actual_fields) = actual.as_object() else {
                return Err(mismatch(path, "object".to_string(), render(actual)));
            };
            for (key, expected_value) in fields {
                let child = join_key(path, key);
                match_at(expected_value, actual_fields.get(key), &child, unordered)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            let Some(actual_items) = actual.as_array() else {
                return Err(mismatch(path, "array".to_string(), render(actual)));
            };
            if unordered {
                match_unordered(items, actual_items, path)
            } else {
                match_subsequence(items, actual_items, path)
            }
        }
        Value::Number(n) => match actual.as_f64() {
            Some(a) if actual.is_number() && n.as_f64() == Some(a) => Ok(()),
            _ => Err(mismatch(path, render(expected), render(actual))),
        },
        _ if expected == actual => Ok(()),
        _ => Err(mismatch(path, render(expected), render(actual))),
    }
}

fn match_subsequence(expected: &[Value], actual: &[Value], path: &str) -> Result<(), FieldMismatch> {
    let mut cursor = 0;
    for (index, item) in expected.iter().enumerate() {
        let found = (cursor..actual.len())
            .find(|&j| match_at(item, Some(&actual[j]), "", false).is_ok());
        match found {
            Some(j) => cursor = j + 1,
            None => return Err(element_mismatch(item, actual, index, path, false)),
        }
    }
    Ok(())
}

fn match_unordered(expected: &[Value], actual: &[Value], path: &str) -> Result<(), FieldMismatch> {
    let compatible: Vec<Vec<bool>> = expected
        .iter()
        .map(|item| {
            actual
                .iter()
                .map(|candidate| match_at(item, Some(candidate), "", true).is_ok())
                .collect()
        })
        .collect();

    // owner[j] is the declared element currently assigned to actual[j]
    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    for (index, item) in expected.iter().enumerate() {
        let mut visited = vec![false; actual.len()];
        if !assign(index, &compatible, &mut owner, &mut visited) {
            return Err(element_mismatch(item, actual, index, path, true));
        }
    }
    Ok(())
}

/// Augmenting path search: give `index` a partner, moving earlier
/// assignments along when they have an alternative
fn assign(index: usize, compatible: &[Vec<bool>], owner: &mut [Option<usize>], visited: &mut [bool]) -> bool {
    for j in 0..owner.len() {
        if !compatible[index][j] || visited[j] {
            continue;
        }
        visited[j] = true;
        let current = owner[j];
        let free = match current {
            None => true,
            Some(other) => assign(other, compatible, owner, visited),
        };
        if free {
            owner[j] = Some(index);
            return true;
        }
    }
    false
}

/// Explain why declared element `index` found no partner, preferring the
/// deep diff against the element at the same position
fn element_mismatch(
    item: &Value,
    actual: &[Value],
    index: usize,
    path: &str,
    unordered: bool,
) -> FieldMismatch {
    let child = join_index(path, index);
    match match_at(item, actual.get(index), &child, unordered) {
        Err(deep) => deep,
        Ok(()) if unordered => mismatch(&child, render(item), "no distinct matching element".to_string()),
        Ok(()) => mismatch(
            &child,
            render(item),
            "no matching element in order".to_string(),
        ),
    }
}

/// Every key (object body) or substring (text body) must be present
pub fn check_contains(keys: &[String], actual: &Value) -> Result<(), FieldMismatch> {
    match actual {
        Value::Object(fields) => match keys.iter().find(|k| !fields.contains_key(k.as_str())) {
            Some(key) => Err(mismatch(key, "present".to_string(), MISSING.to_string())),
            None => Ok(()),
        },
        Value::String(text) => match keys.iter().find(|k| !text.contains(k.as_str())) {
            Some(key) => Err(mismatch("", format!("text containing {:?}", key), render(actual))),
            None => Ok(()),
        },
        other => Err(mismatch("", "object or text".to_string(), render(other))),
    }
}

pub fn check_kind(kind: ResponseKind, actual: &Value) -> Result<(), FieldMismatch> {
    if kind.matches(actual) {
        Ok(())
    } else {
        Err(mismatch("", kind.to_string(), kind_of(actual).to_string()))
    }
}

/// Exact and minimum element counts of an array body
pub fn check_items(exact: Option<usize>, min: Option<usize>, actual: &Value) -> Result<(), FieldMismatch> {
    let Some(items) = actual.as_array() else {
        return Err(mismatch("", "array".to_string(), kind_of(actual).to_string()));
    };
    if let Some(n) = exact {
        if items.len() != n {
            return Err(mismatch("", format!("{} items", n), format!("{} items", items.len())));
        }
    }
    if let Some(n) = min {
        if items.len() < n {
            return Err(mismatch("", format!("at least {} items", n), format!("{} items", items.len())));
        }
    }
    Ok(())
}

/// Look up a dotted/indexed field path such as `data.items[0].id`
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices.split('[').filter(|s| !s.is_empty()) {
            let index: usize = index.strip_suffix(']')?.parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compact JSON rendering, truncated for summaries
pub fn render(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > RENDER_LIMIT {
        let cut: String = text.chars().take(RENDER_LIMIT).collect();
        format!("{}...", cut)
    } else {
        text
    }
}

fn mismatch(path: &str, expected: String, actual: String) -> FieldMismatch {
    FieldMismatch {
        path: path.to_string(),
        expected,
        actual,
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn join_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}
