//! Named-value store backing `${key}` substitution in spec fields.
//!
//! Tasks publish sentinels into a local scratchpad; the coordinator merges
//! them into the global one after the task runs, first writer wins. Specs
//! built later see every sentinel produced by their prerequisites.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScratchpadError {
    #[error("scratchpad key not found: {0}")]
    MissingKey(String),
}

pub type Result<T> = std::result::Result<T, ScratchpadError>;

/// String-to-string sentinel map with `${key}` substitution over nested
/// structured data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scratchpad {
    sentinels: BTreeMap<String, String>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scratchpad from an existing key/value mapping.
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self { sentinels: map }
    }

    /// Store a sentinel, overwriting any previous value for the key.
    pub fn store(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.sentinels.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.sentinels.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sentinels.is_empty()
    }

    pub fn sentinels(&self) -> &BTreeMap<String, String> {
        &self.sentinels
    }

    /// Merge another scratchpad into this one. Keys already present keep
    /// their value, so sibling tasks running in parallel cannot clobber
    /// each other's sentinels. Merging twice is a no-op.
    pub fn merge(&mut self, other: &Scratchpad) {
        for (key, value) in &other.sentinels {
            self.sentinels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Replace every `${key}` occurrence in a string. Unknown keys either
    /// fail or are left literal, per `ignore_missing`.
    pub fn replace_str(&self, input: &str, ignore_missing: bool) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match parse_placeholder(after) {
                Some((name, consumed)) => {
                    match self.sentinels.get(name) {
                        Some(value) => out.push_str(value),
                        None if ignore_missing => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                        None => return Err(ScratchpadError::MissingKey(name.to_string())),
                    }
                    rest = &after[consumed..];
                }
                None => {
                    // not a placeholder, keep the marker literal
                    out.push_str("${");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Walk a nested value (maps, lists, scalars) and substitute inside
    /// every string leaf.
    pub fn replace_value(&self, value: &Value, ignore_missing: bool) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.replace_str(s, ignore_missing)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.replace_value(v, ignore_missing))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.replace_value(v, ignore_missing)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

/// Parse `name}` from the text following a `${` marker. Returns the key
/// name and the number of bytes consumed (name plus closing brace), or
/// `None` when the text is not a well-formed placeholder.
fn parse_placeholder(after: &str) -> Option<(&str, usize)> {
    let bytes = after.as_bytes();
    let first = *bytes.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    for (idx, &b) in bytes.iter().enumerate().skip(1) {
        if b == b'}' {
            return Some((&after[..idx], idx + 1));
        }
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
    }
    None
}
