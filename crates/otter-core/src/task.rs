//! The contract for a single unit of work.
//!
//! A task is a spec bound to a body implementing [`Runnable`] plus the
//! runtime context the coordinator and worker thread state through. States
//! move monotonically; the only branch is whether a run emitted subtask
//! specs, which parks the task until its children finish.

use crate::config::Config;
use crate::manifest::{Artifact, TaskManifest};
use crate::scratchpad::Scratchpad;
use crate::spec::Spec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task run failed: {0}")]
    Run(String),
    #[error("task validation failed: {0}")]
    Validation(String),
}

impl TaskError {
    /// Wrap any displayable error as a run failure.
    pub fn run(err: impl std::fmt::Display) -> Self {
        Self::Run(err.to_string())
    }

    /// Wrap any displayable error as a validation failure.
    pub fn validation(err: impl std::fmt::Display) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Execution state of a task. No back edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    PendingRun,
    Running,
    /// Parked until every spec the task emitted reaches DONE.
    WaitingForSubtasks,
    PendingValidation,
    Validating,
    Done,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingRun => "PENDING_RUN",
            Self::Running => "RUNNING",
            Self::WaitingForSubtasks => "WAITING_FOR_SUBTASKS",
            Self::PendingValidation => "PENDING_VALIDATION",
            Self::Validating => "VALIDATING",
            Self::Done => "DONE",
        }
    }
}

/// Which body method a state selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Run,
    Validate,
}

/// Per-task runtime bundle handed to the body during execution.
pub struct TaskContext {
    /// The immutable run configuration.
    pub config: Arc<Config>,
    /// Local scratchpad; merged into the global one (first writer wins)
    /// after the task runs.
    pub scratchpad: Scratchpad,
    /// Specs emitted during the run, to be scheduled by the coordinator.
    pub specs: Vec<Spec>,
    /// Cancellation signal; long-running bodies should observe it and
    /// short-circuit.
    pub abort: CancellationToken,
    pub state: State,
    /// Free-form log lines, drained into the task manifest after each
    /// phase.
    pub log: Vec<String>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("state", &self.state)
            .field("specs", &self.specs.len())
            .field("aborted", &self.abort.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            scratchpad: Scratchpad::new(),
            specs: Vec::new(),
            abort: CancellationToken::new(),
            state: State::PendingRun,
            log: Vec::new(),
        }
    }

    /// Queue a spec for the coordinator to schedule. The emitting task
    /// will not complete until the spec's task reaches DONE.
    pub fn emit_spec(&mut self, spec: Spec) {
        self.specs.push(spec);
    }

    /// Record a log line for the task manifest.
    pub fn log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }
}

/// The capability set of a task body: perform the work, optionally check
/// the result. A body with nothing to check inherits the trivial pass.
#[async_trait]
pub trait Runnable: Send {
    /// Perform the work, returning the artifacts produced.
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>>;

    /// Check the result of a finished run.
    async fn validate(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// An executable instance: spec, context, manifest, and body.
pub struct Task {
    pub spec: Spec,
    pub context: TaskContext,
    pub manifest: TaskManifest,
    pub artifacts: Vec<Artifact>,
    body: Box<dyn Runnable>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.spec.name)
            .field("state", &self.context.state)
            .field("result", &self.manifest.result)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(spec: Spec, context: TaskContext, body: Box<dyn Runnable>) -> Self {
        let manifest = TaskManifest::new(&spec.name);
        Self {
            spec,
            context,
            manifest,
            artifacts: Vec::new(),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> State {
        self.context.state
    }

    /// The state that follows the current one. Purely a function of the
    /// current state, except that a run which emitted specs parks instead
    /// of proceeding to validation.
    pub fn next_state(&self) -> State {
        match self.context.state {
            State::PendingRun => State::Running,
            State::Running if !self.context.specs.is_empty() => State::WaitingForSubtasks,
            State::Running => State::PendingValidation,
            State::WaitingForSubtasks => State::PendingValidation,
            State::PendingValidation => State::Validating,
            State::Validating | State::Done => State::Done,
        }
    }

    /// The body method the current state selects, if any.
    pub fn execution_method(&self) -> Option<Method> {
        match self.context.state {
            State::Running => Some(Method::Run),
            State::Validating => Some(Method::Validate),
            _ => None,
        }
    }

    /// Run the body, collecting produced artifacts onto the task.
    pub async fn run(&mut self) -> Result<()> {
        let artifacts = self.body.run(&mut self.context).await?;
        self.artifacts.extend(artifacts);
        Ok(())
    }

    /// Validate the finished run.
    pub async fn validate(&mut self) -> Result<()> {
        self.body.validate(&mut self.context).await
    }

    /// Mark the task aborted without invoking the body.
    pub fn abort(&mut self) {
        self.manifest.abort();
    }

    /// Drain emitted specs for the coordinator to schedule.
    pub fn take_emitted_specs(&mut self) -> Vec<Spec> {
        std::mem::take(&mut self.context.specs)
    }
}
