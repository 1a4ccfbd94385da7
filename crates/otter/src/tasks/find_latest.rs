//! Find the most recently modified file under a prefix and publish its
//! location as a sentinel for downstream specs.

use crate::registry::{BuildError, Result as BuildResult};
use crate::storage::StorageHandle;
use async_trait::async_trait;
use otter_core::{split_glob, Artifact, Runnable, Spec, TaskContext, TaskError};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct FindLatestSpec {
    name: String,
    /// Prefix to search under; may include glob patterns.
    source: String,
    /// Sentinel key for the result. Defaults to the task name.
    scratchpad_key: Option<String>,
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: FindLatestSpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(FindLatest { spec: parsed }))
}

struct FindLatest {
    spec: FindLatestSpec,
}

#[async_trait]
impl Runnable for FindLatest {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        let (prefix, pattern) = split_glob(&self.spec.source);
        let handle = resolve(&prefix, ctx)?;
        let locations = handle
            .glob(if pattern.is_empty() { "*" } else { &pattern })
            .await
            .map_err(TaskError::run)?;

        let mut latest: Option<(String, f64)> = None;
        for location in locations {
            let stat = StorageHandle::external(&location)
                .map_err(TaskError::run)?
                .stat()
                .await
                .map_err(TaskError::run)?;
            let mtime = stat.mtime.unwrap_or(0.0);
            if latest.as_ref().is_none_or(|(_, best)| mtime > *best) {
                latest = Some((location, mtime));
            }
        }

        match latest {
            Some((location, _)) => {
                info!(latest = %location, "latest file found");
                let key = self
                    .spec
                    .scratchpad_key
                    .clone()
                    .unwrap_or_else(|| self.spec.name.clone());
                ctx.scratchpad.store(key, location);
                Ok(Vec::new())
            }
            None => Err(TaskError::Run(format!(
                "no files found matching {}",
                self.spec.source
            ))),
        }
    }
}

fn resolve(prefix: &str, ctx: &TaskContext) -> Result<StorageHandle, TaskError> {
    if prefix.contains("://") || prefix.starts_with('/') {
        StorageHandle::external(prefix).map_err(TaskError::run)
    } else {
        StorageHandle::new(prefix, &ctx.config).map_err(TaskError::run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_core::Config;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_the_newest_file_in_the_scratchpad() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("v1.json");
        let new = dir.path().join("v2.json");
        std::fs::write(&old, b"{}").unwrap();
        std::fs::write(&new, b"{}").unwrap();
        // push the second file's mtime into the future
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let file = std::fs::File::options().write(true).open(&new).unwrap();
        file.set_modified(later).unwrap();

        let spec = Spec::from_value(json!({
            "name": "find_latest release",
            "source": format!("{}/*.json", dir.path().display()),
            "scratchpad_key": "latest_release",
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config::default()));
        let mut body = build(&spec, &ctx).unwrap();
        body.run(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.scratchpad.get("latest_release").unwrap(),
            new.display().to_string()
        );
    }

    #[tokio::test]
    async fn key_defaults_to_the_task_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("only.json"), b"{}").unwrap();

        let spec = Spec::from_value(json!({
            "name": "find_latest release",
            "source": format!("{}/*.json", dir.path().display()),
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config::default()));
        let mut body = build(&spec, &ctx).unwrap();
        body.run(&mut ctx).await.unwrap();
        assert!(ctx.scratchpad.get("find_latest release").is_some());
    }

    #[tokio::test]
    async fn no_matches_is_a_run_failure() {
        let dir = TempDir::new().unwrap();
        let spec = Spec::from_value(json!({
            "name": "find_latest release",
            "source": format!("{}/*.json", dir.path().display()),
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config::default()));
        let mut body = build(&spec, &ctx).unwrap();
        assert!(body.run(&mut ctx).await.is_err());
    }
}
