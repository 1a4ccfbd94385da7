//! Copy a list of external files into a release directory, with bounded
//! concurrency and retry on transport timeouts.

use crate::registry::{BuildError, Result as BuildResult};
use crate::storage::{StorageError, StorageHandle};
use async_trait::async_trait;
use otter_core::{Artifact, Config, Runnable, Spec, TaskContext, TaskError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct CopyManySpec {
    /// Source URIs. Must be absolute.
    sources: Vec<String>,
    /// Destination directory, relative to the release root.
    destination: String,
    /// Concurrent copy limit.
    #[serde(default = "default_concurrency")]
    max_concurrency: usize,
}

fn default_concurrency() -> usize {
    10
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: CopyManySpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(CopyMany { spec: parsed }))
}

struct CopyMany {
    spec: CopyManySpec,
}

async fn copy_single(
    source: &str,
    destination_dir: &str,
    config: &Arc<Config>,
    semaphore: &Semaphore,
) -> Result<Artifact, TaskError> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|e| TaskError::run(format!("semaphore closed: {e}")))?;

    let filename = source.rsplit('/').next().unwrap_or(source);
    let dest_path = format!("{destination_dir}/{filename}");

    for attempt in 0..=MAX_RETRIES {
        let src = StorageHandle::external(source).map_err(TaskError::run)?;
        let dst = StorageHandle::new(&dest_path, config).map_err(TaskError::run)?;
        match src.copy_to(&dst).await {
            Ok(_) => {
                info!(source, destination = %dest_path, "copied");
                return Ok(Artifact::new(src.absolute(), dst.absolute()));
            }
            Err(StorageError::Timeout(_)) if attempt < MAX_RETRIES => {
                let delay = RETRY_DELAY * 2u32.pow(attempt);
                warn!(source, attempt, "timeout while copying, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(TaskError::run(e)),
        }
    }
    Err(TaskError::Run(format!("retries exhausted copying {source}")))
}

#[async_trait]
impl Runnable for CopyMany {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        info!(
            count = self.spec.sources.len(),
            destination = %self.spec.destination,
            "copying files"
        );

        let semaphore = Semaphore::new(self.spec.max_concurrency.max(1));
        let config = Arc::clone(&ctx.config);

        let copies = self.spec.sources.iter().map(|source| {
            copy_single(source, &self.spec.destination, &config, &semaphore)
        });
        let artifacts = futures::future::try_join_all(copies).await?;

        info!(count = artifacts.len(), "all files copied");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn copies_every_source() {
        let work = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        let mut sources = Vec::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let path = external.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            sources.push(path.display().to_string());
        }

        let spec = Spec::from_value(json!({
            "name": "copy_many inputs",
            "sources": sources,
            "destination": "input",
            "max_concurrency": 2,
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config {
            work_path: work.path().to_path_buf(),
            ..Config::default()
        }));
        let mut body = build(&spec, &ctx).unwrap();

        let artifacts = body.run(&mut ctx).await.unwrap();
        assert_eq!(artifacts.len(), 3);
        for name in ["a.txt", "b.txt", "c.txt"] {
            assert!(work.path().join("input").join(name).is_file());
        }
    }

    #[tokio::test]
    async fn one_missing_source_fails_the_task() {
        let work = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        let good = external.path().join("good.txt");
        std::fs::write(&good, b"x").unwrap();

        let spec = Spec::from_value(json!({
            "name": "copy_many inputs",
            "sources": [good.display().to_string(), "/nonexistent/otter/bad.txt"],
            "destination": "input",
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config {
            work_path: work.path().to_path_buf(),
            ..Config::default()
        }));
        let mut body = build(&spec, &ctx).unwrap();
        assert!(body.run(&mut ctx).await.is_err());
    }
}
