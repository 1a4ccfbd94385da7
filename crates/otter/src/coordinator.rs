//! Coordinates the execution of a step's tasks.
//!
//! Single instance per step. Each polling tick the coordinator drains
//! finished tasks from the result channel, resumes parents whose subtasks
//! all finished, and promotes specs whose prerequisites are DONE into
//! tasks on the worker channel. The step completes when every expected
//! spec has been built and every task is DONE.
//!
//! The coordinator is the single writer for the step's task slots, the
//! remaining-spec queue, and the parent/subtask tracking; workers only see
//! the one task they are executing.

use crate::registry::{BuildError, TaskRegistry};
use crate::step::{Step, TaskSlot};
use crate::worker::worker_loop;
use otter_core::{Config, Outcome, Spec, State, Task};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Polling period of the coordinator loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long workers get to finish their current task on shutdown before
/// being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StepError {
    #[error("task {name} failed to run: {reason}")]
    TaskRun { name: String, reason: String },
    #[error("task {name} failed validation: {reason}")]
    TaskValidation { name: String, reason: String },
    #[error("task {name} failed: {reason}")]
    TaskFailed { name: String, reason: String },
    #[error("error building task for spec {name}: {source}")]
    TaskBuild { name: String, source: BuildError },
    #[error("duplicate task: {0}")]
    DuplicateTask(String),
    #[error("run interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, StepError>;

pub struct Coordinator {
    step: Step,
    registry: TaskRegistry,
    config: Arc<Config>,
    /// Specs not yet built into tasks, in submission order.
    remaining_specs: VecDeque<Spec>,
    /// Total specs expected; grows when tasks emit new ones.
    expected_spec_count: usize,
    /// Parent name → names of the specs it emitted; parents stay parked in
    /// WAITING_FOR_SUBTASKS until every child is DONE.
    task_subtasks: HashMap<String, Vec<String>>,
    task_tx: async_channel::Sender<Task>,
    task_rx: async_channel::Receiver<Task>,
    result_tx: tokio::sync::mpsc::UnboundedSender<Task>,
    result_rx: tokio::sync::mpsc::UnboundedReceiver<Task>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("step", &self.step.name)
            .field("expected_spec_count", &self.expected_spec_count)
            .field("remaining_specs", &self.remaining_specs.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(step: Step, registry: TaskRegistry, config: Arc<Config>) -> Self {
        Self::with_shutdown(step, registry, config, CancellationToken::new())
    }

    /// Use an externally owned shutdown token, e.g. wired to SIGINT.
    pub fn with_shutdown(
        step: Step,
        registry: TaskRegistry,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> Self {
        let (task_tx, task_rx) = async_channel::unbounded();
        let (result_tx, result_rx) = tokio::sync::mpsc::unbounded_channel();
        let expected_spec_count = step.specs.len();
        let remaining_specs: VecDeque<Spec> = step.specs.clone().into();
        Self {
            step,
            registry,
            config,
            remaining_specs,
            expected_spec_count,
            task_subtasks: HashMap::new(),
            task_tx,
            task_rx,
            result_tx,
            result_rx,
            workers: Vec::new(),
            shutdown,
        }
    }

    /// Run the step to completion. The returned step carries the finished
    /// manifest either way; the error reports why a failed run stopped.
    pub async fn run(mut self) -> (Step, Result<()>) {
        info!(step = %self.step.name, "starting coordinator");
        self.step.start();
        self.start_workers();

        let result = self.drive().await;

        let failure_reason = match &result {
            Ok(()) => {
                self.stop_workers().await;
                None
            }
            Err(e) => {
                error!(error = %e, "stopping run");
                self.kill_workers().await;
                Some(e.to_string())
            }
        };

        let outcome = match &result {
            Ok(()) => self.step.result(),
            Err(StepError::Interrupted) => Outcome::Aborted,
            Err(_) => Outcome::Failure,
        };
        self.step.finish(outcome, failure_reason);

        (self.step, result)
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.process_done_tasks().await?;
            self.complete_waiting_parents().await?;
            self.process_ready_specs().await?;

            if self.is_step_complete() {
                info!(step = %self.step.name, tasks = self.step.tasks.len(), "step complete");
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                return Err(StepError::Interrupted);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drain every task returned by the workers and advance it one state.
    async fn process_done_tasks(&mut self) -> Result<()> {
        while let Ok(mut task) = self.result_rx.try_recv() {
            let name = task.name().to_string();

            match task.manifest.result {
                Outcome::Failure => {
                    let reason = task.manifest.failure_reason.clone().unwrap_or_default();
                    let state = task.state();
                    self.step.upsert_task_manifest(&task);
                    self.park(task);
                    return Err(match state {
                        State::Running => StepError::TaskRun { name, reason },
                        State::Validating => StepError::TaskValidation { name, reason },
                        _ => StepError::TaskFailed { name, reason },
                    });
                }
                Outcome::Aborted => {
                    task.context.state = State::Done;
                    self.step.upsert_task_manifest(&task);
                    self.park(task);
                    continue;
                }
                _ => {}
            }

            task.context.state = task.next_state();
            match task.state() {
                // the task just finished running: schedule anything it
                // emitted and publish its sentinels before any dependent
                // is built
                State::PendingValidation | State::WaitingForSubtasks => {
                    let emitted = task.take_emitted_specs();
                    self.collect_new_specs(&name, emitted);
                    self.registry
                        .scratchpad_mut()
                        .merge(&task.context.scratchpad);

                    if task.state() == State::PendingValidation {
                        self.enqueue(task).await?;
                    } else {
                        debug!(task = %name, "parking task until subtasks finish");
                        self.park(task);
                    }
                }
                State::Done => {
                    self.step.upsert_task_manifest(&task);
                    self.park(task);
                }
                other => {
                    warn!(task = %name, state = other.as_str(), "unexpected state from worker");
                    self.park(task);
                }
            }
        }
        Ok(())
    }

    /// Resume parked parents whose children are all DONE, repeating until
    /// a pass resumes nothing.
    async fn complete_waiting_parents(&mut self) -> Result<()> {
        loop {
            let ready: Vec<String> = self
                .task_subtasks
                .iter()
                .filter(|(parent, children)| {
                    self.step.task_state(parent) == Some(State::WaitingForSubtasks)
                        && children
                            .iter()
                            .all(|c| self.step.task_state(c) == Some(State::Done))
                })
                .map(|(parent, _)| parent.clone())
                .collect();
            if ready.is_empty() {
                return Ok(());
            }

            for parent in ready {
                info!(task = %parent, "all subtasks done, resuming parent");
                self.task_subtasks.remove(&parent);
                let slot = self
                    .step
                    .tasks
                    .get_mut(&parent)
                    .expect("waiting parent has a slot");
                let mut task = slot.task.take().expect("waiting parent is parked");
                task.context.state = task.next_state();
                slot.state = task.state();
                self.step.upsert_task_manifest(&task);
                self.send(task).await?;
            }
        }
    }

    /// Build every spec whose prerequisites are all DONE and enqueue the
    /// resulting tasks; blocked specs stay queued.
    async fn process_ready_specs(&mut self) -> Result<()> {
        let mut blocked = VecDeque::new();
        while let Some(spec) = self.remaining_specs.pop_front() {
            if self.is_spec_ready(&spec) {
                self.build_and_enqueue(spec).await?;
            } else {
                blocked.push_back(spec);
            }
        }
        self.remaining_specs = blocked;
        Ok(())
    }

    fn is_spec_ready(&self, spec: &Spec) -> bool {
        spec.requires
            .iter()
            .all(|name| self.step.task_state(name) == Some(State::Done))
    }

    async fn build_and_enqueue(&mut self, spec: Spec) -> Result<()> {
        let name = spec.name.clone();
        if self.step.tasks.contains_key(&name) {
            return Err(StepError::DuplicateTask(name));
        }

        let task = self.registry.build(&spec).map_err(|source| StepError::TaskBuild {
            name: name.clone(),
            source,
        })?;

        self.step.upsert_task_manifest(&task);
        self.enqueue(task).await
    }

    /// Track specs a task emitted: queue them for building and hold the
    /// parent until they finish.
    fn collect_new_specs(&mut self, parent: &str, specs: Vec<Spec>) {
        if specs.is_empty() {
            return;
        }
        info!(task = parent, count = specs.len(), "task generated new specs");
        self.task_subtasks
            .entry(parent.to_string())
            .or_default()
            .extend(specs.iter().map(|s| s.name.clone()));
        self.expected_spec_count += specs.len();
        self.step.specs.extend(specs.iter().cloned());
        self.remaining_specs.extend(specs);
    }

    /// Hand a task to the workers, leaving an in-flight slot behind.
    async fn enqueue(&mut self, task: Task) -> Result<()> {
        debug!(task = %task.name(), "enqueuing task");
        self.step.tasks.insert(
            task.name().to_string(),
            TaskSlot {
                state: task.state(),
                task: None,
            },
        );
        self.send(task).await
    }

    async fn send(&self, task: Task) -> Result<()> {
        self.task_tx
            .send(task)
            .await
            .map_err(|_| StepError::Interrupted)
    }

    /// Store a task the coordinator holds on to (done, parked, or failed).
    fn park(&mut self, task: Task) {
        let name = task.name().to_string();
        let state = task.state();
        self.step.tasks.insert(
            name,
            TaskSlot {
                state,
                task: Some(task),
            },
        );
    }

    fn is_step_complete(&self) -> bool {
        self.step.tasks.len() == self.expected_spec_count
            && self
                .step
                .tasks
                .values()
                .all(|slot| slot.state == State::Done)
    }

    fn start_workers(&mut self) {
        info!(count = self.config.pool_size, "starting workers");
        for worker_id in 0..self.config.pool_size {
            let span = info_span!("worker", worker_id, role = "W");
            let handle = tokio::spawn(
                worker_loop(
                    worker_id,
                    self.task_rx.clone(),
                    self.result_tx.clone(),
                    self.shutdown.clone(),
                )
                .instrument(span),
            );
            self.workers.push(handle);
        }
    }

    /// Graceful stop: signal shutdown, give workers the grace period to
    /// finish their current task, abort stragglers.
    async fn stop_workers(&mut self) {
        info!("stopping workers");
        self.shutdown.cancel();
        for mut handle in self.workers.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("worker did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Immediate stop for the failure path.
    async fn kill_workers(&mut self) {
        warn!("killing workers");
        self.shutdown.cancel();
        for handle in self.workers.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otter_core::{Artifact, Runnable, Scratchpad, TaskContext, TaskError};
    use serde_json::json;

    struct Probe;

    #[async_trait]
    impl Runnable for Probe {
        async fn run(
            &mut self,
            ctx: &mut TaskContext,
        ) -> std::result::Result<Vec<Artifact>, TaskError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.scratchpad.store("probe_ran", "yes");
            Ok(Vec::new())
        }
    }

    struct Failing;

    #[async_trait]
    impl Runnable for Failing {
        async fn run(
            &mut self,
            _ctx: &mut TaskContext,
        ) -> std::result::Result<Vec<Artifact>, TaskError> {
            Err(TaskError::Run("exploded".to_string()))
        }
    }

    struct Spawner;

    #[async_trait]
    impl Runnable for Spawner {
        async fn run(
            &mut self,
            ctx: &mut TaskContext,
        ) -> std::result::Result<Vec<Artifact>, TaskError> {
            ctx.emit_spec(Spec::from_value(json!({"name": "probe child_1"})).unwrap());
            ctx.emit_spec(Spec::from_value(json!({"name": "probe child_2"})).unwrap());
            Ok(Vec::new())
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry =
            TaskRegistry::new(Arc::new(test_config()), Scratchpad::new());
        registry.register("probe", |_, _| Ok(Box::new(Probe)));
        registry.register("failing", |_, _| Ok(Box::new(Failing)));
        registry.register("spawner", |_, _| Ok(Box::new(Spawner)));
        registry
    }

    fn test_config() -> Config {
        Config {
            pool_size: 2,
            ..Config::default()
        }
    }

    fn spec(value: serde_json::Value) -> Spec {
        Spec::from_value(value).unwrap()
    }

    async fn run_step(specs: Vec<Spec>) -> (Step, Result<()>) {
        let step = Step::new("test-step", specs);
        let coordinator = Coordinator::new(step, registry(), Arc::new(test_config()));
        coordinator.run().await
    }

    #[tokio::test(start_paused = true)]
    async fn empty_step_completes_immediately_with_success() {
        let (step, result) = run_step(Vec::new()).await;
        assert!(result.is_ok());
        assert_eq!(step.manifest.result, Outcome::Success);
        assert!(step.manifest.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_task_runs_to_done() {
        let (step, result) = run_step(vec![spec(json!({"name": "probe one"}))]).await;
        assert!(result.is_ok());
        assert_eq!(step.manifest.result, Outcome::Success);
        assert_eq!(step.task_state("probe one"), Some(State::Done));
        let manifest = step.manifest.task("probe one").unwrap();
        assert_eq!(manifest.result, Outcome::Success);
        assert!(manifest.started_run_at.unwrap() <= manifest.finished_run_at.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn requires_orders_execution() {
        let (step, result) = run_step(vec![
            spec(json!({"name": "probe first"})),
            spec(json!({"name": "probe second"})),
            spec(json!({
                "name": "probe third",
                "requires": ["probe first", "probe second"],
            })),
        ])
        .await;
        assert!(result.is_ok());

        let third = step.manifest.task("probe third").unwrap();
        let first = step.manifest.task("probe first").unwrap();
        let second = step.manifest.task("probe second").unwrap();
        let prereq_finish = first
            .finished_run_at
            .unwrap()
            .max(second.finished_run_at.unwrap());
        assert!(third.started_run_at.unwrap() >= prereq_finish);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_subtasks_hold_the_parent() {
        let (step, result) = run_step(vec![spec(json!({"name": "spawner parent"}))]).await;
        assert!(result.is_ok());

        // parent plus two children
        assert_eq!(step.manifest.tasks.len(), 3);
        assert_eq!(step.task_state("spawner parent"), Some(State::Done));
        assert_eq!(step.task_state("probe child_1"), Some(State::Done));
        assert_eq!(step.task_state("probe child_2"), Some(State::Done));

        // the parent finishes only after both children are done
        let parent = step.manifest.task("spawner parent").unwrap();
        for child in ["probe child_1", "probe child_2"] {
            let child = step.manifest.task(child).unwrap();
            assert!(
                parent.finished_validation_at.unwrap() >= child.finished_run_at.unwrap()
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_failure_fails_the_step() {
        let (step, result) = run_step(vec![spec(json!({"name": "failing one"}))]).await;

        match result {
            Err(StepError::TaskRun { name, reason }) => {
                assert_eq!(name, "failing one");
                assert!(reason.contains("exploded"));
            }
            other => panic!("expected TaskRun error, got {other:?}"),
        }
        assert_eq!(step.manifest.result, Outcome::Failure);
        assert!(step.manifest.failure_reason.is_some());
        let manifest = step.manifest.task("failing one").unwrap();
        assert!(manifest.failure_reason.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_spec_names_are_fatal() {
        let (_step, result) = run_step(vec![
            spec(json!({"name": "probe twin"})),
            spec(json!({"name": "probe twin"})),
        ])
        .await;
        assert!(matches!(result, Err(StepError::DuplicateTask(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_task_type_is_a_build_error() {
        let (_step, result) = run_step(vec![spec(json!({"name": "mystery one"}))]).await;
        assert!(matches!(
            result,
            Err(StepError::TaskBuild {
                source: BuildError::UnknownTaskType(_),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinels_flow_to_dependent_tasks() {
        // the dependent's spec refers to a sentinel the first task stores
        let (step, result) = run_step(vec![
            spec(json!({"name": "probe producer"})),
            spec(json!({
                "name": "probe consumer",
                "requires": ["probe producer"],
                "marker": "${probe_ran}",
            })),
        ])
        .await;
        assert!(result.is_ok());
        let slot = &step.tasks["probe consumer"];
        let consumer = slot.task.as_ref().unwrap();
        assert_eq!(consumer.spec.field("marker").unwrap(), "yes");
    }
}
