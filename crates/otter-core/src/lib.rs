pub mod config;
pub mod manifest;
pub mod scratchpad;
pub mod spec;
pub mod task;
pub mod util;

pub use config::{Config, ConfigError, ConfigFile, LogLevel, Overrides};
pub use manifest::{
    step_key, Artifact, Lineage, Outcome, RootManifest, StepManifest, TaskManifest,
};
pub use scratchpad::{Scratchpad, ScratchpadError};
pub use spec::{Spec, SpecError};
pub use task::{Method, Runnable, State, Task, TaskContext, TaskError};
pub use util::{collapse_slashes, split_glob};
