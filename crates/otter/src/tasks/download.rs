//! Download a release artifact to the local work path.
//!
//! The source must be relative to the release root; the local destination
//! mirrors the same relative path under the work path, so later tasks can
//! address the file identically in both places. No artifact is produced:
//! the downloaded copy stays local.

use crate::registry::{BuildError, Result as BuildResult};
use crate::storage::StorageHandle;
use crate::validators;
use async_trait::async_trait;
use otter_core::{Artifact, Runnable, Spec, TaskContext, TaskError};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct DownloadSpec {
    /// Source location, relative to the release root.
    source: String,
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: DownloadSpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(Download { spec: parsed }))
}

struct Download {
    spec: DownloadSpec,
}

#[async_trait]
impl Runnable for Download {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        let src = StorageHandle::new(&self.spec.source, &ctx.config).map_err(TaskError::run)?;
        if src.is_absolute() {
            return Err(TaskError::Run(
                "source must be relative to the release root".to_string(),
            ));
        }
        let dst = StorageHandle::local(&self.spec.source, &ctx.config).map_err(TaskError::run)?;

        info!(source = %src.absolute(), destination = %dst.absolute(), "downloading file");
        src.copy_to(&dst).await.map_err(TaskError::run)?;

        Ok(Vec::new())
    }

    /// Check that the local copy exists and matches the source size.
    async fn validate(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        validators::check(
            "exists",
            validators::exists(&self.spec.source, &ctx.config, true).await,
        )?;
        validators::check(
            "same_size",
            validators::same_size(&self.spec.source, &self.spec.source, &ctx.config, true).await,
        )
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
    async fn downloads_release_file_to_work_path() {
        let work = TempDir::new().unwrap();
        let release = TempDir::new().unwrap();
        std::fs::create_dir_all(release.path().join("input")).unwrap();
        std::fs::write(release.path().join("input/a.txt"), b"payload").unwrap();

        let spec = Spec::from_value(json!({
            "name": "download a",
            "source": "input/a.txt",
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config {
            work_path: work.path().to_path_buf(),
            release_uri: Some(release.path().display().to_string()),
            ..Config::default()
        }));
        let mut body = build(&spec, &ctx).unwrap();

        let artifacts = body.run(&mut ctx).await.unwrap();
        assert!(artifacts.is_empty());
        assert_eq!(
            std::fs::read(work.path().join("input/a.txt")).unwrap(),
            b"payload"
        );

        body.validate(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn absolute_source_is_rejected() {
        let work = TempDir::new().unwrap();
        let spec = Spec::from_value(json!({
            "name": "download a",
            "source": "gs://bucket/a.txt",
        }))
        .unwrap();
        let mut ctx = TaskContext::new(Arc::new(Config {
            work_path: work.path().to_path_buf(),
            ..Config::default()
        }));
        let mut body = build(&spec, &ctx).unwrap();
        let err = body.run(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("relative to the release root"));
    }
}
