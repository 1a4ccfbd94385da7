//! Task registry: maps task types to factories and builds tasks from
//! specs.
//!
//! Building a task applies scratchpad substitution to the spec's fields,
//! re-validates the spec, then hands it to the factory registered under
//! the task type (the first token of the spec name). The registry also
//! owns the global scratchpad that substitution draws from.

use otter_core::{
    Config, Runnable, Scratchpad, ScratchpadError, Spec, Task, TaskContext,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("invalid spec {name}: {reason}")]
    InvalidSpec { name: String, reason: String },
    #[error(transparent)]
    Scratchpad(#[from] ScratchpadError),
}

impl BuildError {
    /// Shorthand for factories rejecting a malformed spec.
    pub fn invalid(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidSpec {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Constructs a task body from a substituted spec.
pub type TaskFactory = fn(&Spec, &TaskContext) -> Result<Box<dyn Runnable>>;

pub struct TaskRegistry {
    config: Arc<Config>,
    scratchpad: Scratchpad,
    factories: HashMap<String, TaskFactory>,
    /// Task types whose specs are always substituted leniently.
    lenient_types: HashSet<String>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.factories.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    pub fn new(config: Arc<Config>, scratchpad: Scratchpad) -> Self {
        Self {
            config,
            scratchpad,
            factories: HashMap::new(),
            lenient_types: HashSet::new(),
        }
    }

    /// Register a task factory under its task type token.
    pub fn register(&mut self, task_type: &str, factory: TaskFactory) {
        debug!(task_type, "registering task type");
        self.factories.insert(task_type.to_string(), factory);
    }

    /// Register a task type whose specs are substituted leniently: unknown
    /// `${key}` references are left literal at build time instead of
    /// failing it. For task types that expand nested template specs
    /// against sentinels only their own run produces.
    pub fn register_lenient(&mut self, task_type: &str, factory: TaskFactory) {
        self.register(task_type, factory);
        self.lenient_types.insert(task_type.to_string());
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// The global scratchpad specs are substituted against.
    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    pub fn scratchpad_mut(&mut self) -> &mut Scratchpad {
        &mut self.scratchpad
    }

    /// Build a task from a spec: substitute, re-validate, instantiate.
    pub fn build(&self, spec: &Spec) -> Result<Task> {
        debug!(name = %spec.name, "building task");

        let ignore_missing = spec.scratchpad_ignore_missing
            || self.lenient_types.contains(spec.task_type());
        let substituted = self
            .scratchpad
            .replace_value(&spec.to_value(), ignore_missing)?;
        let spec = Spec::from_value(substituted)
            .map_err(|e| BuildError::invalid(&spec.name, e))?;

        let factory = self
            .factories
            .get(spec.task_type())
            .ok_or_else(|| BuildError::UnknownTaskType(spec.task_type().to_string()))?;

        let context = TaskContext::new(Arc::clone(&self.config));
        let body = factory(&spec, &context)?;
        Ok(Task::new(spec, context, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otter_core::{Artifact, TaskError};
    use serde_json::json;

    struct Probe;

    #[async_trait]
    impl Runnable for Probe {
        async fn run(
            &mut self,
            _ctx: &mut TaskContext,
        ) -> std::result::Result<Vec<Artifact>, TaskError> {
            Ok(Vec::new())
        }
    }

    fn probe_factory(_spec: &Spec, _ctx: &TaskContext) -> Result<Box<dyn Runnable>> {
        Ok(Box::new(Probe))
    }

    fn registry_with(scratchpad: Scratchpad) -> TaskRegistry {
        let mut registry = TaskRegistry::new(Arc::new(Config::default()), scratchpad);
        registry.register("probe", probe_factory);
        registry
    }

    #[test]
    fn builds_registered_task_types() {
        let registry = registry_with(Scratchpad::new());
        let spec = Spec::from_value(json!({"name": "probe one"})).unwrap();
        let task = registry.build(&spec).unwrap();
        assert_eq!(task.name(), "probe one");
    }

    #[test]
    fn unknown_task_type_is_rejected() {
        let registry = registry_with(Scratchpad::new());
        let spec = Spec::from_value(json!({"name": "mystery one"})).unwrap();
        assert!(matches!(
            registry.build(&spec),
            Err(BuildError::UnknownTaskType(t)) if t == "mystery"
        ));
    }

    #[test]
    fn substitution_is_applied_to_spec_fields() {
        let mut pad = Scratchpad::new();
        pad.store("src", "/data");
        let registry = registry_with(pad);

        let spec = Spec::from_value(json!({
            "name": "probe one",
            "source": "${src}/a.txt",
        }))
        .unwrap();
        let task = registry.build(&spec).unwrap();
        assert_eq!(task.spec.field("source").unwrap(), "/data/a.txt");
    }

    #[test]
    fn missing_key_fails_the_build() {
        let registry = registry_with(Scratchpad::new());
        let spec = Spec::from_value(json!({
            "name": "probe one",
            "source": "${missing}/a.txt",
        }))
        .unwrap();
        assert!(matches!(
            registry.build(&spec),
            Err(BuildError::Scratchpad(_))
        ));
    }

    #[test]
    fn lenient_task_types_build_with_unknown_keys() {
        let mut registry = registry_with(Scratchpad::new());
        registry.register_lenient("template", probe_factory);

        let spec = Spec::from_value(json!({
            "name": "template explode",
            "do": [{"name": "probe use ${match_stem}"}],
        }))
        .unwrap();
        let task = registry.build(&spec).unwrap();
        assert_eq!(
            task.spec.field("do").unwrap()[0]["name"],
            "probe use ${match_stem}"
        );

        // strictly registered types still fail on the same spec
        let strict = Spec::from_value(json!({
            "name": "probe explode",
            "do": [{"name": "probe use ${match_stem}"}],
        }))
        .unwrap();
        assert!(matches!(
            registry.build(&strict),
            Err(BuildError::Scratchpad(_))
        ));
    }

    #[test]
    fn ignore_missing_preserves_the_literal() {
        let registry = registry_with(Scratchpad::new());
        let spec = Spec::from_value(json!({
            "name": "probe one",
            "scratchpad_ignore_missing": true,
            "source": "${missing}/a.txt",
        }))
        .unwrap();
        let task = registry.build(&spec).unwrap();
        assert_eq!(task.spec.field("source").unwrap(), "${missing}/a.txt");
    }
}
