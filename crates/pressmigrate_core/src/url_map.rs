use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::error::configuration;

/// External JSON keyed by a natural identifier (usually the original article URL),
/// each key mapping to a list of associated values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl ListMap {
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .get(&normalize_key(key))
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accepts `{"key": ["a", "b"], "other": "single"}`. Scalars become one-element
/// lists, nulls and empty strings are dropped, anything else is rejected.
pub fn parse_list_map(content: &str) -> Result<ListMap> {
    let trimmed = content.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Ok(ListMap::default());
    }
    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|error| configuration(format!("invalid JSON map: {error}")))?;
    let Some(object) = parsed.as_object() else {
        return Err(configuration("JSON map must be an object at the top level"));
    };

    let mut entries = BTreeMap::new();
    for (key, value) in object {
        let values = match value {
            Value::Null => Vec::new(),
            Value::String(text) => vec![text.clone()],
            Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::String(text) => values.push(text.clone()),
                        Value::Number(number) => values.push(number.to_string()),
                        other => {
                            return Err(configuration(format!(
                                "JSON map entry {key:?} contains a non-scalar value: {other}"
                            )));
                        }
                    }
                }
                values
            }
            Value::Number(number) => vec![number.to_string()],
            other => {
                return Err(configuration(format!(
                    "JSON map entry {key:?} must be a list, got {other}"
                )));
            }
        };
        let values = values
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>();
        entries
            .entry(normalize_key(key))
            .or_insert_with(Vec::new)
            .extend(values);
    }
    Ok(ListMap { entries })
}

pub fn read_list_map(path: &Path) -> Result<ListMap> {
    let content = fs::read_to_string(path).map_err(|error| {
        configuration(format!("failed to read JSON map {}: {error}", path.display()))
    })?;
    parse_list_map(&content)
}

/// URL keys match regardless of scheme, a trailing slash, or surrounding space.
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}
