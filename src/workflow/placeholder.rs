//! `${step}` / `${step.field}` references inside step arguments.
//!
//! Only a string that is *entirely* one placeholder counts; the resolved
//! value replaces the string as-is, so numbers and objects keep their type.
//! Placeholders are found recursively through arrays and objects.

use std::collections::HashMap;

use serde_json::Value;

use super::types::StepResult;

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub step: String,
    /// Dotted path into the payload; empty means the whole payload.
    pub path: Vec<String>,
}

impl Placeholder {
    /// Parse `${step}` or `${step.a.b}`. Anything else is `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text.strip_prefix("${")?.strip_suffix('}')?;
        if inner.is_empty() || inner.contains(['{', '}', '$']) {
            return None;
        }

        let mut parts = inner.split('.');
        let step = parts.next()?.trim();
        if step.is_empty() {
            return None;
        }
        let path: Vec<String> = parts.map(|p| p.trim().to_string()).collect();
        if path.iter().any(String::is_empty) {
            return None;
        }

        Some(Self {
            step: step.to_string(),
            path,
        })
    }

    /// Walk the path into `payload`. Array elements are addressed by index.
    pub fn lookup<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        self.path.iter().try_fold(payload, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// Step ids referenced anywhere in `value`, first occurrence order, deduplicated.
pub fn references(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(p) = Placeholder::parse(s) {
                if !found.contains(&p.step) {
                    found.push(p.step);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Arguments after substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    /// Placeholder strings left in place because their step has no
    /// successful result.
    pub unresolved: Vec<String>,
}

/// Substitute every placeholder in `value` from `results`.
///
/// A path that is missing from the payload falls back to the whole payload.
/// A step that has no result, or failed, leaves the placeholder text as-is
/// and lists it in `unresolved`.
pub fn resolve(value: &Value, results: &HashMap<String, StepResult>) -> Resolved {
    let mut unresolved = Vec::new();
    let value = substitute(value, results, &mut unresolved);
    Resolved { value, unresolved }
}

fn substitute(
    value: &Value,
    results: &HashMap<String, StepResult>,
    unresolved: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(s) => {
            let Some(placeholder) = Placeholder::parse(s) else {
                return value.clone();
            };
            let payload = results
                .get(&placeholder.step)
                .filter(|r| r.success)
                .and_then(|r| r.payload.as_ref());
            match payload {
                Some(payload) => placeholder.lookup(payload).unwrap_or(payload).clone(),
                None => {
                    unresolved.push(s.clone());
                    value.clone()
                }
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(v, results, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, results, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
