//! Manifest models for a run.
//!
//! A run publishes a single `manifest.json` at the release root (or the
//! local work path when no release is configured). The file nests three
//! levels: root → steps → tasks, with a result rolled up at each level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a task, a step, or the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Not yet started, or still in progress.
    #[default]
    Pending,
    Success,
    Failure,
    /// Stopped before completion for external reasons.
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        }
    }
}

/// Lineage endpoint of an artifact: a single URI or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lineage {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for Lineage {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for Lineage {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<String>> for Lineage {
    fn from(value: Vec<String>) -> Self {
        Self::Many(value)
    }
}

/// Pipeline lineage record attached to a task: where a produced resource
/// came from and where it ended up. No schema is enforced beyond the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub source: Lineage,
    pub destination: Lineage,
}

impl Artifact {
    pub fn new(source: impl Into<Lineage>, destination: impl Into<Lineage>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Record of a single task inside a step manifest.
///
/// Fields not known to this model are preserved across a
/// deserialize/serialize round trip via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub name: String,
    #[serde(default)]
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_validation_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_validation_at: Option<DateTime<Utc>>,
    /// Seconds spent in `run`, stamped when the run phase finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_elapsed: Option<f64>,
    /// Seconds spent in `validate`, stamped when the validation phase finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_elapsed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Outcome::Pending,
            started_run_at: None,
            finished_run_at: None,
            started_validation_at: None,
            finished_validation_at: None,
            run_elapsed: None,
            validation_elapsed: None,
            elapsed: None,
            log: Vec::new(),
            artifacts: Vec::new(),
            failure_reason: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn start_run(&mut self) {
        self.started_run_at = Some(Utc::now());
    }

    pub fn finish_run(&mut self) {
        self.finished_run_at = Some(Utc::now());
        self.run_elapsed = elapsed_secs(self.started_run_at, self.finished_run_at);
        self.update_elapsed();
    }

    pub fn start_validation(&mut self) {
        self.started_validation_at = Some(Utc::now());
    }

    pub fn finish_validation(&mut self) {
        self.finished_validation_at = Some(Utc::now());
        self.validation_elapsed =
            elapsed_secs(self.started_validation_at, self.finished_validation_at);
        self.update_elapsed();
    }

    /// Mark the task failed, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.result = Outcome::Failure;
        self.failure_reason = Some(reason.into());
    }

    /// Mark the task aborted before completion.
    pub fn abort(&mut self) {
        self.result = Outcome::Aborted;
    }

    fn update_elapsed(&mut self) {
        self.elapsed = match (self.run_elapsed, self.validation_elapsed) {
            (Some(r), Some(v)) => Some(r + v),
            _ => None,
        };
    }
}

/// Record of one step: its tasks, their artifacts, and the rolled-up result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub name: String,
    #[serde(default)]
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskManifest>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl StepManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Outcome::Pending,
            started_run_at: None,
            finished_run_at: None,
            elapsed: None,
            log: Vec::new(),
            tasks: Vec::new(),
            artifacts: Vec::new(),
            failure_reason: None,
        }
    }

    /// Replace the manifest for a task already present, or append a new one.
    /// Artifacts carried by the task manifest are accumulated on the step.
    pub fn upsert_task(&mut self, task: &TaskManifest) {
        if !task.artifacts.is_empty() {
            self.artifacts.extend(task.artifacts.iter().cloned());
        }
        if let Some(existing) = self.tasks.iter_mut().find(|t| t.name == task.name) {
            *existing = task.clone();
        } else {
            self.tasks.push(task.clone());
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskManifest> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn start(&mut self) {
        self.started_run_at = Some(Utc::now());
    }

    pub fn finish(&mut self, result: Outcome, failure_reason: Option<String>) {
        self.finished_run_at = Some(Utc::now());
        self.elapsed = elapsed_secs(self.started_run_at, self.finished_run_at);
        self.result = result;
        self.failure_reason = failure_reason;
    }
}

/// Root of the manifest: step manifests keyed by `<runner_name>_<step_name>`.
///
/// The namespaced key lets several runners publish into one release without
/// clobbering each other's slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootManifest {
    #[serde(default)]
    pub result: Outcome,
    pub started_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepManifest>,
}

impl RootManifest {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            result: Outcome::Pending,
            started_at: now,
            modified_at: now,
            log: Vec::new(),
            steps: BTreeMap::new(),
        }
    }

    /// Insert or replace a step manifest under its namespaced key and
    /// refresh `modified_at` and the rolled-up result.
    pub fn upsert_step(&mut self, key: impl Into<String>, step: StepManifest) {
        self.steps.insert(key.into(), step);
        self.modified_at = Utc::now();
        self.recalculate_result();
    }

    /// Rollup rule: any failed or aborted step fails the root; the root
    /// succeeds only once every step has succeeded.
    pub fn recalculate_result(&mut self) {
        self.result = if self
            .steps
            .values()
            .any(|s| matches!(s.result, Outcome::Failure | Outcome::Aborted))
        {
            Outcome::Failure
        } else if self.steps.values().all(|s| s.result == Outcome::Success) {
            Outcome::Success
        } else {
            Outcome::Pending
        };
    }
}

impl Default for RootManifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot key for a step in the root manifest.
pub fn step_key(runner_name: &str, step_name: &str) -> String {
    format!("{runner_name}_{step_name}")
}

fn elapsed_secs(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&Outcome::Failure).unwrap(), "\"failure\"");
    }

    #[test]
    fn artifact_accepts_single_and_many() {
        let single = Artifact::new("a", "b");
        let json = serde_json::to_value(&single).unwrap();
        assert_eq!(json["source"], "a");

        let many = Artifact::new(vec!["a".to_string(), "b".to_string()], "c");
        let json = serde_json::to_value(&many).unwrap();
        assert_eq!(json["source"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn task_manifest_round_trips_unknown_fields() {
        let payload = serde_json::json!({
            "name": "copy something",
            "result": "success",
            "log": ["copied"],
            "artifacts": [],
            "custom_field": {"nested": 1},
        });
        let manifest: TaskManifest = serde_json::from_value(payload.clone()).unwrap();
        assert_eq!(manifest.extra["custom_field"]["nested"], 1);

        let back = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["custom_field"], payload["custom_field"]);
        assert_eq!(back["name"], "copy something");
    }

    #[test]
    fn finish_run_stamps_elapsed() {
        let mut m = TaskManifest::new("hello_world greet");
        m.start_run();
        m.finish_run();
        assert!(m.run_elapsed.is_some());
        // elapsed needs both phases
        assert!(m.elapsed.is_none());

        m.start_validation();
        m.finish_validation();
        assert!(m.validation_elapsed.is_some());
        assert!(m.elapsed.is_some());
    }

    #[test]
    fn upsert_task_replaces_by_name() {
        let mut step = StepManifest::new("load");
        let mut task = TaskManifest::new("copy a");
        step.upsert_task(&task);
        assert_eq!(step.tasks.len(), 1);
        assert_eq!(step.tasks[0].result, Outcome::Pending);

        task.result = Outcome::Success;
        step.upsert_task(&task);
        assert_eq!(step.tasks.len(), 1);
        assert_eq!(step.tasks[0].result, Outcome::Success);
    }

    #[test]
    fn upsert_task_accumulates_artifacts() {
        let mut step = StepManifest::new("load");
        let mut task = TaskManifest::new("copy a");
        task.artifacts.push(Artifact::new("src", "dst"));
        step.upsert_task(&task);
        step.upsert_task(&task);
        assert_eq!(step.artifacts.len(), 2);
    }

    #[test]
    fn root_rollup_failure_dominates() {
        let mut root = RootManifest::new();
        let mut ok = StepManifest::new("one");
        ok.result = Outcome::Success;
        let mut bad = StepManifest::new("two");
        bad.result = Outcome::Aborted;
        root.upsert_step("runner_one", ok);
        root.upsert_step("runner_two", bad);
        assert_eq!(root.result, Outcome::Failure);
    }

    #[test]
    fn root_rollup_success_requires_all() {
        let mut root = RootManifest::new();
        let mut ok = StepManifest::new("one");
        ok.result = Outcome::Success;
        root.upsert_step("runner_one", ok);
        root.upsert_step("runner_two", StepManifest::new("two"));
        assert_eq!(root.result, Outcome::Pending);

        let mut ok2 = StepManifest::new("two");
        ok2.result = Outcome::Success;
        root.upsert_step("runner_two", ok2);
        assert_eq!(root.result, Outcome::Success);
    }

    #[test]
    fn root_manifest_round_trips() {
        let mut root = RootManifest::new();
        let mut step = StepManifest::new("load");
        let mut task = TaskManifest::new("copy a");
        task.result = Outcome::Success;
        step.upsert_task(&task);
        step.result = Outcome::Success;
        root.upsert_step(step_key("otter", "load"), step);

        let payload = serde_json::to_string_pretty(&root).unwrap();
        let parsed: RootManifest = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, root);
        assert!(parsed.steps.contains_key("otter_load"));
    }

    #[test]
    fn step_key_namespaces_by_runner() {
        assert_eq!(step_key("otter", "load"), "otter_load");
    }
}
