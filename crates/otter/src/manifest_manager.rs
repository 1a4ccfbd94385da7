//! Publishes run state to the release under optimistic concurrency.
//!
//! The manifest is a single JSON file shared by every runner publishing
//! into the release. All mutation goes through a read-modify-write loop
//! keyed on the revision returned by the read: a conditional write that
//! loses the race re-reads the winner's state and retries. There is no
//! retry cap; progress only requires some publisher to win each round.

use crate::storage::{StorageError, StorageHandle};
use otter_core::{step_key, Config, Outcome, RootManifest, StepManifest};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const MANIFEST_FILENAME: &str = "manifest.json";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest: {0}")]
    Invalid(String),
    #[error("error serializing manifest: {0}")]
    Serialize(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Wraps the root manifest with its single atomic operation: upsert one
/// step manifest and publish the result.
#[derive(Debug)]
pub struct ManifestManager {
    config: Arc<Config>,
}

impl ManifestManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Target handle: the release when one is configured, the work path
    /// otherwise.
    fn handle(&self) -> Result<StorageHandle> {
        let handle = match self.config.release_uri {
            Some(_) => StorageHandle::new(MANIFEST_FILENAME, &self.config)?,
            None => StorageHandle::local(MANIFEST_FILENAME, &self.config)?,
        };
        Ok(handle)
    }

    /// Empty manifest with a placeholder slot for every configured step.
    fn bootstrap(&self) -> RootManifest {
        let mut root = RootManifest::new();
        for step in &self.config.steps {
            root.steps.insert(
                step_key(&self.config.runner_name, step),
                StepManifest::new(step.clone()),
            );
        }
        root
    }

    fn serialize(root: &RootManifest) -> Result<String> {
        serde_json::to_string_pretty(root).map_err(|e| ManifestError::Serialize(e.to_string()))
    }

    /// Upsert a finished step manifest into the root manifest and publish
    /// it, retrying optimistic-concurrency conflicts indefinitely.
    pub async fn update(&self, step_manifest: StepManifest) -> Result<Outcome> {
        match step_manifest.result {
            Outcome::Success => info!(step = %step_manifest.name, "step ran successfully"),
            Outcome::Failure | Outcome::Aborted => {
                error!(step = %step_manifest.name, "step failed");
            }
            Outcome::Pending => info!(step = %step_manifest.name, "step is pending"),
        }

        let handle = self.handle()?;
        let key = step_key(&self.config.runner_name, &step_manifest.name);

        match handle.stat().await {
            Err(StorageError::NotFound(_)) => {
                info!(target = %handle.absolute(), "no manifest found, creating new one");
                let mut root = self.bootstrap();
                root.upsert_step(key, step_manifest);
                handle.write_text(&Self::serialize(&root)?, None).await?;
                return Ok(root.result);
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        // a local-only run has a single writer, so it skips the
        // optimistic check
        let optimistic = self.config.release_uri.is_some();

        loop {
            let (payload, revision) = handle.read_text().await?;
            let mut root: RootManifest = serde_json::from_str(&payload)
                .map_err(|e| ManifestError::Invalid(e.to_string()))?;
            root.upsert_step(key.clone(), step_manifest.clone());

            let expected = optimistic.then_some(&revision);
            match handle
                .write_text(&Self::serialize(&root)?, expected)
                .await
            {
                Ok(_) => {
                    info!(step = %step_manifest.name, target = %handle.absolute(), "manifest updated");
                    return Ok(root.result);
                }
                Err(StorageError::PreconditionFailed(_)) => {
                    warn!(
                        target = %handle.absolute(),
                        "manifest was modified by another publisher, retrying"
                    );
                    let jitter = rand::thread_rng().gen_range(Duration::ZERO..RETRY_BASE_DELAY);
                    tokio::time::sleep(RETRY_BASE_DELAY + jitter).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_config(dir: &TempDir, step: &str, steps: &[&str]) -> Arc<Config> {
        Arc::new(Config {
            step: step.to_string(),
            steps: steps.iter().map(ToString::to_string).collect(),
            work_path: dir.path().to_path_buf(),
            release_uri: None,
            ..Config::default()
        })
    }

    fn finished_step(name: &str, result: Outcome) -> StepManifest {
        let mut step = StepManifest::new(name);
        step.start();
        step.finish(result, None);
        step
    }

    #[tokio::test]
    async fn bootstrap_seeds_placeholders_for_every_step() {
        let dir = TempDir::new().unwrap();
        let config = local_config(&dir, "load", &["load", "transform"]);
        let manager = ManifestManager::new(config);

        manager
            .update(finished_step("load", Outcome::Success))
            .await
            .unwrap();

        let payload = std::fs::read_to_string(dir.path().join("manifest.json")).unwrap();
        let root: RootManifest = serde_json::from_str(&payload).unwrap();
        assert_eq!(root.steps.len(), 2);
        assert_eq!(root.steps["otter_load"].result, Outcome::Success);
        assert_eq!(root.steps["otter_transform"].result, Outcome::Pending);
        assert_eq!(root.result, Outcome::Pending);
    }

    #[tokio::test]
    async fn second_update_merges_into_existing_manifest() {
        let dir = TempDir::new().unwrap();
        let manager = ManifestManager::new(local_config(&dir, "load", &["load", "transform"]));

        manager
            .update(finished_step("load", Outcome::Success))
            .await
            .unwrap();
        let result = manager
            .update(finished_step("transform", Outcome::Success))
            .await
            .unwrap();

        assert_eq!(result, Outcome::Success);
        let payload = std::fs::read_to_string(dir.path().join("manifest.json")).unwrap();
        let root: RootManifest = serde_json::from_str(&payload).unwrap();
        assert_eq!(root.steps["otter_load"].result, Outcome::Success);
        assert_eq!(root.steps["otter_transform"].result, Outcome::Success);
        assert_eq!(root.result, Outcome::Success);
    }

    #[tokio::test]
    async fn failed_step_fails_the_root() {
        let dir = TempDir::new().unwrap();
        let manager = ManifestManager::new(local_config(&dir, "load", &["load"]));
        let result = manager
            .update(finished_step("load", Outcome::Failure))
            .await
            .unwrap();
        assert_eq!(result, Outcome::Failure);
    }

    #[tokio::test]
    async fn invalid_manifest_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"not json").unwrap();
        let manager = ManifestManager::new(local_config(&dir, "load", &["load"]));
        let err = manager
            .update(finished_step("load", Outcome::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }
}
