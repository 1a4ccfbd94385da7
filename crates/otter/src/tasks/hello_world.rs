//! Smallest possible task, useful for smoke-testing a step.

use crate::registry::{BuildError, Result as BuildResult};
use async_trait::async_trait;
use otter_core::{Artifact, Runnable, Spec, TaskContext, TaskError};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct HelloWorldSpec {
    /// Who to greet.
    #[serde(default = "default_who")]
    who: String,
}

fn default_who() -> String {
    "world".to_string()
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: HelloWorldSpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(HelloWorld { spec: parsed }))
}

struct HelloWorld {
    spec: HelloWorldSpec,
}

#[async_trait]
impl Runnable for HelloWorld {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        info!("saying hello...");
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!(who = %self.spec.who, "hello");
        ctx.log(format!("hello {}", self.spec.who));
        Ok(vec![Artifact::new("me", self.spec.who.as_str())])
    }

    async fn validate(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        info!("did we say hello properly?");
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.log("yes we did");
        Ok(())
    }
}
