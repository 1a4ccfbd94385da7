//! Expand a glob into one set of subtask specs per matched file.
//!
//! Every spec in `do` is instantiated once per match, with a task-local
//! scratchpad providing `${match_prefix}`, `${match_path}`,
//! `${match_stem}`, `${match_ext}`, `${uri}` and `${uuid}`. The task type
//! is registered lenient, so those placeholders survive the registry's
//! global substitution at build time; unknown keys in the templates are
//! likewise left literal here, for the global scratchpad to resolve when
//! the child is built. The emitted specs hold this task in
//! WAITING_FOR_SUBTASKS until they all finish.

use crate::registry::{BuildError, Result as BuildResult};
use crate::storage::StorageHandle;
use async_trait::async_trait;
use otter_core::{
    collapse_slashes, split_glob, Artifact, Runnable, Scratchpad, Spec, TaskContext, TaskError,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ExplodeGlobSpec {
    /// The glob expression to expand.
    glob: String,
    /// Template specs to instantiate for each match.
    #[serde(rename = "do")]
    do_specs: Vec<Spec>,
}

pub fn build(spec: &Spec, _ctx: &TaskContext) -> BuildResult<Box<dyn Runnable>> {
    let parsed: ExplodeGlobSpec = spec
        .parse()
        .map_err(|e| BuildError::invalid(&spec.name, e))?;
    Ok(Box::new(ExplodeGlob { spec: parsed }))
}

struct ExplodeGlob {
    spec: ExplodeGlobSpec,
}

/// Strip the release root or work path from a location, leaving a
/// release-relative path. External locations pass through.
fn strip_root(location: &str, release_uri: Option<&str>, work_path: &str) -> String {
    if let Some(release) = release_uri {
        if let Some(rest) = location.strip_prefix(release) {
            return rest.trim_start_matches('/').to_string();
        }
    }
    if let Some(rest) = location.strip_prefix(work_path) {
        return rest.trim_start_matches('/').to_string();
    }
    location.to_string()
}

/// Collapse substitution-introduced double slashes in every string leaf.
fn collapse_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(collapse_slashes(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(collapse_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, collapse_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[async_trait]
impl Runnable for ExplodeGlob {
    async fn run(&mut self, ctx: &mut TaskContext) -> Result<Vec<Artifact>, TaskError> {
        let (prefix, pattern) = split_glob(&self.spec.glob);
        let handle = if prefix.contains("://") || prefix.starts_with('/') {
            StorageHandle::external(&prefix).map_err(TaskError::run)?
        } else {
            StorageHandle::new(&prefix, &ctx.config).map_err(TaskError::run)?
        };
        let files = handle
            .glob(if pattern.is_empty() { "*" } else { &pattern })
            .await
            .map_err(TaskError::run)?;

        let release_uri = ctx.config.release_uri.clone();
        let work_path = ctx.config.work_path_str();
        let rel_prefix = strip_root(handle.absolute(), release_uri.as_deref(), &work_path);

        let mut new_tasks = 0usize;
        for file in files {
            let uri = strip_root(&file, release_uri.as_deref(), &work_path);
            let relative_path = uri
                .strip_prefix(&rel_prefix)
                .unwrap_or(&uri)
                .trim_start_matches('/')
                .to_string();
            let match_prefix = rel_prefix.trim_end_matches('/');
            let (match_path, filename) = match relative_path.rsplit_once('/') {
                Some((path, name)) => (path, name),
                None => ("", relative_path.as_str()),
            };
            let (match_stem, match_ext) = match filename.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => (stem, ext),
                // dotfile or no extension
                _ => (filename, ""),
            };

            let mut pad = Scratchpad::new();
            pad.store("uri", uri.as_str());
            pad.store("match_prefix", match_prefix);
            pad.store("match_path", match_path);
            pad.store("match_stem", match_stem);
            pad.store("match_ext", match_ext);
            pad.store("uuid", Uuid::new_v4().to_string());

            for template in &self.spec.do_specs {
                // unknown keys stay literal for the registry's global
                // substitution pass at child build time
                let replaced = pad
                    .replace_value(&template.to_value(), true)
                    .map_err(TaskError::run)?;
                let subtask_spec =
                    Spec::from_value(collapse_value(replaced)).map_err(TaskError::run)?;
                ctx.emit_spec(subtask_spec);
                new_tasks += 1;
            }
        }

        info!(count = new_tasks, "exploded into new tasks");
        ctx.log(format!("exploded into {new_tasks} new tasks"));
        Ok(Vec::new())
    }
}
