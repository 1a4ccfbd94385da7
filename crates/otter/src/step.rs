//! A step ties a name to its specs, the tasks built from them, and the
//! step manifest the run publishes.

use otter_core::{Outcome, Spec, State, StepManifest, Task};
use std::collections::HashMap;
use tracing::{error, info};

/// Where a built task currently lives, from the coordinator's point of
/// view. Workers own the task while it is in flight; the coordinator
/// parks it here otherwise.
#[derive(Debug)]
pub struct TaskSlot {
    pub state: State,
    pub task: Option<Task>,
}

#[derive(Debug)]
pub struct Step {
    pub name: String,
    pub specs: Vec<Spec>,
    /// One slot per built task, keyed by spec name. Only the coordinator
    /// writes here.
    pub tasks: HashMap<String, TaskSlot>,
    pub manifest: StepManifest,
}

impl Step {
    pub fn new(name: impl Into<String>, specs: Vec<Spec>) -> Self {
        let name = name.into();
        let manifest = StepManifest::new(&name);
        Self {
            name,
            specs,
            tasks: HashMap::new(),
            manifest,
        }
    }

    pub fn start(&mut self) {
        self.manifest.start();
        info!(step = %self.name, "step started running");
    }

    pub fn finish(&mut self, result: Outcome, failure_reason: Option<String>) {
        self.manifest.finish(result, failure_reason);
        match result {
            Outcome::Success => {
                info!(
                    step = %self.name,
                    elapsed = self.manifest.elapsed,
                    "step completed"
                );
            }
            _ => error!(step = %self.name, "step failed"),
        }
    }

    /// Record a task's manifest (and artifacts) on the step manifest.
    pub fn upsert_task_manifest(&mut self, task: &Task) {
        let mut manifest = task.manifest.clone();
        manifest.artifacts = task.artifacts.clone();
        self.manifest.upsert_task(&manifest);
    }

    /// The state of a built task, if the spec has been built.
    pub fn task_state(&self, name: &str) -> Option<State> {
        self.tasks.get(name).map(|slot| slot.state)
    }

    /// Result for the finished step: failure if any task failed, success
    /// otherwise.
    pub fn result(&self) -> Outcome {
        if self
            .manifest
            .tasks
            .iter()
            .any(|t| matches!(t.result, Outcome::Failure | Outcome::Aborted))
        {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }
}
