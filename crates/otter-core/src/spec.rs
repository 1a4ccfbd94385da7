//! Declarative task descriptions.
//!
//! A spec is frozen at construction: the coordinator builds a task from it
//! exactly once, after scratchpad substitution. The first whitespace-separated
//! token of the name selects the task implementation from the registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid spec: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("spec name is empty")]
    EmptyName,
}

pub type Result<T> = std::result::Result<T, SpecError>;

/// Declarative description of one task.
///
/// Common fields are typed here; task-type-specific fields (`source`,
/// `destination`, `glob`, ...) ride along in `fields` and are deserialized
/// by the task implementation once substitution has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// Unique within the step, conventionally `"<task_type> <label>"`.
    pub name: String,
    /// Names of specs in the same step that must be DONE before this one
    /// is built.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Leave unknown `${key}` references literal instead of failing the
    /// build.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub scratchpad_ignore_missing: bool,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Spec {
    /// The registry key: first whitespace-separated token of the name.
    pub fn task_type(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    /// The whole spec as a JSON value, common fields included, for
    /// scratchpad substitution.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("spec serializes to a JSON object")
    }

    /// Rebuild a spec from a substituted value, re-validating the common
    /// fields.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let spec: Spec = serde_json::from_value(value)?;
        if spec.name.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }
        Ok(spec)
    }

    /// Deserialize the task-type-specific view of this spec.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    /// Access a free-form field by name.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Parse the spec list for one step out of a YAML document.
pub fn specs_from_yaml(yaml: &str) -> std::result::Result<Vec<Spec>, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}
