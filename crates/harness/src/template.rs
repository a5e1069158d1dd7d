//! Capture substitution for endpoints, headers and bodies
//!
//! Placeholders are `{{name}}` or the legacy `{saved_name}`. A body string that
//! consists of exactly one placeholder is replaced by the captured value itself,
//! so numeric ids stay numeric.

use serde_json::Value;
use std::collections::BTreeMap;

/// Values captured by earlier steps of one scenario
pub type Captures = BTreeMap<String, Value>;

/// A placeholder that no earlier step captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub name: String,
}

struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

/// Substitute every placeholder in `template`
pub fn render_str(template: &str, captures: &Captures) -> Result<String, Unresolved> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(p) = next_placeholder(rest) {
        out.push_str(&rest[..p.start]);
        let value = captures.get(p.name).ok_or_else(|| Unresolved {
            name: p.name.to_string(),
        })?;
        out.push_str(&value_as_text(value));
        rest = &rest[p.end..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Substitute placeholders in every string inside a JSON value
pub fn render_value(value: &Value, captures: &Captures) -> Result<Value, Unresolved> {
    match value {
        Value::String(s) => {
            if let Some(p) = next_placeholder(s) {
                if p.start == 0 && p.end == s.len() {
                    return captures.get(p.name).cloned().ok_or_else(|| Unresolved {
                        name: p.name.to_string(),
                    });
                }
            }
            render_str(s, captures).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, captures))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (key, field) in fields {
                out.insert(key.clone(), render_value(field, captures)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Names referenced by a template, in order of appearance
pub fn referenced_names(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(p) = next_placeholder(rest) {
        names.push(p.name.to_string());
        rest = &rest[p.end..];
    }
    names
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn next_placeholder(s: &str) -> Option<Placeholder<'_>> {
    let mut offset = 0;
    while offset < s.len() {
        let hay = &s[offset..];
        let brace = hay.find('{')?;
        let start = offset + brace;
        let tail = &s[start..];

        let found = if let Some(inner) = tail.strip_prefix("{{") {
            inner.find("}}").map(|close| {
                let raw = &inner[..close];
                (raw.trim(), start + 2 + close + 2)
            })
        } else if let Some(inner) = tail.strip_prefix("{saved_") {
            inner.find('}').map(|close| (&inner[..close], start + 7 + close + 1))
        } else {
            None
        };

        if let Some((name, end)) = found {
            if is_identifier(name) {
                return Some(Placeholder { start, end, name });
            }
        }
        offset = start + 1;
    }
    None
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
