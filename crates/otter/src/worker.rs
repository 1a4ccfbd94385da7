//! Workers execute tasks handed to them by the coordinator.
//!
//! A worker drains one task at a time from the shared channel, advances
//! its state once, dispatches to the method that state selects, and hands
//! the mutated task back on the result channel. Workers own no scheduling
//! policy: they never look at `requires` or at other tasks.

use otter_core::{Method, Outcome, Task, TaskError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Env toggle for verbose failure detail in logs.
const SHOW_EXCEPTIONS_ENV: &str = "OTTER_SHOW_EXCEPTIONS";

/// Long-lived worker loop. Stops when the shutdown signal is set or the
/// task channel closes; a task already being executed runs to completion
/// first.
pub async fn worker_loop(
    worker_id: usize,
    task_rx: async_channel::Receiver<Task>,
    result_tx: tokio::sync::mpsc::UnboundedSender<Task>,
    shutdown: CancellationToken,
) {
    info!(worker_id, "worker started");

    loop {
        let task = tokio::select! {
            () = shutdown.cancelled() => break,
            recv = task_rx.recv() => match recv {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let name = task.name().to_string();
        debug!(worker_id, task = %name, "executing task");
        let task = execute_task(task, &shutdown).await;
        debug!(worker_id, task = %name, "completed task");

        if result_tx.send(task).is_err() {
            break;
        }
    }

    info!(worker_id, "worker shutting down");
}

/// Advance a task one state and run the method that state selects. When
/// the shutdown signal is already set, the task is marked aborted and
/// forwarded without executing.
pub async fn execute_task(mut task: Task, shutdown: &CancellationToken) -> Task {
    task.context.state = task.next_state();
    task.context.abort = shutdown.clone();

    if shutdown.is_cancelled() {
        task.abort();
        return task;
    }

    match task.execution_method() {
        Some(Method::Run) => {
            task.manifest.start_run();
            let result = task.run().await;
            task.manifest.finish_run();
            finish_phase(&mut task, result);
        }
        Some(Method::Validate) => {
            task.manifest.start_validation();
            let result = task.validate().await;
            task.manifest.finish_validation();
            finish_phase(&mut task, result);
        }
        None => {}
    }

    task
}

/// The report wrapper's bookkeeping: drain log lines into the manifest and
/// record the phase outcome. An error never escapes the worker; it becomes
/// a failure on the task manifest.
fn finish_phase(task: &mut Task, result: Result<(), TaskError>) {
    task.manifest.log.append(&mut task.context.log);
    match result {
        Ok(()) => task.manifest.result = Outcome::Success,
        Err(e) => {
            if std::env::var(SHOW_EXCEPTIONS_ENV).is_ok() {
                error!(task = %task.name(), error = ?e, "task failed");
            } else {
                warn!(task = %task.name(), error = %e, "task failed");
            }
            task.manifest.fail(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otter_core::{Artifact, Config, Runnable, Spec, State, TaskContext};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Mock {
        fail_run: bool,
        sleep: bool,
    }

    #[async_trait]
    impl Runnable for Mock {
        async fn run(
            &mut self,
            ctx: &mut TaskContext,
        ) -> Result<Vec<Artifact>, TaskError> {
            if self.sleep {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if self.fail_run {
                return Err(TaskError::Run("boom".to_string()));
            }
            ctx.log("ran");
            Ok(vec![Artifact::new("a", "b")])
        }
    }

    fn mock_task(fail_run: bool, sleep: bool) -> Task {
        let spec = Spec::from_value(json!({"name": "test_task one"})).unwrap();
        let context = TaskContext::new(Arc::new(Config::default()));
        Task::new(spec, context, Box::new(Mock { fail_run, sleep }))
    }

    #[tokio::test]
    async fn run_phase_records_success_and_artifacts() {
        let shutdown = CancellationToken::new();
        let task = execute_task(mock_task(false, false), &shutdown).await;

        assert_eq!(task.state(), State::Running);
        assert_eq!(task.manifest.result, Outcome::Success);
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.manifest.log, vec!["ran"]);
        assert!(task.manifest.started_run_at.is_some());
        assert!(task.manifest.finished_run_at.is_some());
        assert!(task.manifest.run_elapsed.is_some());
    }

    #[tokio::test]
    async fn suspending_bodies_run_to_completion() {
        let shutdown = CancellationToken::new();
        let task = execute_task(mock_task(false, true), &shutdown).await;
        assert_eq!(task.manifest.result, Outcome::Success);
    }

    #[tokio::test]
    async fn run_failure_is_captured_in_the_manifest() {
        let shutdown = CancellationToken::new();
        let task = execute_task(mock_task(true, false), &shutdown).await;

        assert_eq!(task.manifest.result, Outcome::Failure);
        assert_eq!(
            task.manifest.failure_reason.as_deref(),
            Some("task run failed: boom")
        );
    }

    #[tokio::test]
    async fn validation_phase_stamps_timestamps() {
        let shutdown = CancellationToken::new();
        let mut task = mock_task(false, false);
        task.context.state = State::PendingValidation;

        let task = execute_task(task, &shutdown).await;
        assert_eq!(task.state(), State::Validating);
        assert_eq!(task.manifest.result, Outcome::Success);
        assert!(task.manifest.validation_elapsed.is_some());
    }

    #[tokio::test]
    async fn set_shutdown_aborts_without_running() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let task = execute_task(mock_task(false, false), &shutdown).await;

        assert_eq!(task.manifest.result, Outcome::Aborted);
        assert!(task.manifest.started_run_at.is_none());
    }

    #[tokio::test]
    async fn worker_loop_round_trips_tasks() {
        let (task_tx, task_rx) = async_channel::unbounded();
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker_loop(0, task_rx, result_tx, shutdown.clone()));

        task_tx.send(mock_task(false, false)).await.unwrap();
        let done = result_rx.recv().await.unwrap();
        assert_eq!(done.manifest.result, Outcome::Success);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
