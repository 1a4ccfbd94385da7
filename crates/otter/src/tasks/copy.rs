//! Copy a single external file into the release.

use crate::registry::{BuildError, Result as BuildResult};
use crate::storage::StorageHandle;
use crate::validators;
use async_trait::async_trait;
use otter_core::{Artifact, Runnable, Spec, TaskContext, TaskError};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct CopySpec {
    /// Source URI. Must be absolute; this task is for external resources.
    source: String,
    /// Destination, relative to the release root (or the work path for a
    /// local-only run).
    destination: String,
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: CopySpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(Copy { spec: parsed }))
}

struct Copy {
    spec: CopySpec,
}

#[async_trait]
impl Runnable for Copy {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        info!(source = %self.spec.source, destination = %self.spec.destination, "copying file");

        let src = StorageHandle::external(&self.spec.source).map_err(TaskError::run)?;
        let dst =
            StorageHandle::new(&self.spec.destination, &ctx.config).map_err(TaskError::run)?;

        src.copy_to(&dst).await.map_err(TaskError::run)?;

        Ok(vec![Artifact::new(src.absolute(), dst.absolute())])
    }

    /// Check that the copied file exists and matches the source size.
    async fn validate(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        validators::check(
            "exists",
            validators::exists(&self.spec.destination, &ctx.config, false).await,
        )?;
        validators::check(
            "same_size",
            validators::same_size(&self.spec.source, &self.spec.destination, &ctx.config, false)
                .await,
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

    fn context(work: &TempDir) -> TaskContext {
        TaskContext::new(Arc::new(Config {
            work_path: work.path().to_path_buf(),
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn copies_and_validates() {
        let work = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        let source = external.path().join("a.txt");
        std::fs::write(&source, b"payload").unwrap();

        let spec = Spec::from_value(json!({
            "name": "copy a",
            "source": source.display().to_string(),
            "destination": "input/a.txt",
        }))
        .unwrap();
        let mut ctx = context(&work);
        let mut body = build(&spec, &ctx).unwrap();

        let artifacts = body.run(&mut ctx).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(
            std::fs::read(work.path().join("input/a.txt")).unwrap(),
            b"payload"
        );

        body.validate(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn missing_source_fails_the_run() {
        let work = TempDir::new().unwrap();
        let spec = Spec::from_value(json!({
            "name": "copy missing",
            "source": "/nonexistent/otter/a.txt",
            "destination": "input/a.txt",
        }))
        .unwrap();
        let mut ctx = context(&work);
        let mut body = build(&spec, &ctx).unwrap();
        let err = body.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, TaskError::Run(_)));
    }

    #[test]
    fn spec_requires_source_and_destination() {
        let work = TempDir::new().unwrap();
        let ctx = context(&work);
        let spec = Spec::from_value(json!({"name": "copy broken"})).unwrap();
        assert!(build(&spec, &ctx).is_err());
    }
}
