//! Run configuration.
//!
//! A run is configured by a single YAML file holding the runner options,
//! the scratchpad seed, and the spec lists for every step. CLI flags take
//! precedence over file values, which take precedence over defaults.

use crate::scratchpad::Scratchpad;
use crate::spec::Spec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_POOL_SIZE: usize = 1;
pub const DEFAULT_RUNNER_NAME: &str = "otter";
pub const DEFAULT_WORK_PATH: &str = "work";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("step not found in config: {0}")]
    UnknownStep(String),
    #[error("pool_size must be at least 1")]
    InvalidPoolSize,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Log verbosity for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// The raw YAML config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub work_path: Option<PathBuf>,
    pub release_uri: Option<String>,
    pub pool_size: Option<usize>,
    pub log_level: Option<LogLevel>,
    pub runner_name: Option<String>,
    /// Initial sentinels seeded into the global scratchpad.
    pub scratchpad: BTreeMap<String, String>,
    /// Step name → ordered spec list.
    pub steps: BTreeMap<String, Vec<Spec>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// The spec list for one step.
    pub fn specs_for(&self, step: &str) -> Result<Vec<Spec>> {
        self.steps
            .get(step)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStep(step.to_string()))
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.keys().cloned().collect()
    }

    /// The global scratchpad seeded from the config's `scratchpad` mapping.
    pub fn scratchpad(&self) -> Scratchpad {
        Scratchpad::from_map(self.scratchpad.clone())
    }
}

/// CLI-level overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub work_path: Option<PathBuf>,
    pub release_uri: Option<String>,
    pub pool_size: Option<usize>,
    pub log_level: Option<LogLevel>,
    pub runner_name: Option<String>,
}

/// The resolved, immutable configuration a run executes under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The step this run executes.
    pub step: String,
    /// Every step name known to the config; the manifest bootstrap seeds a
    /// placeholder slot for each.
    pub steps: Vec<String>,
    pub config_path: PathBuf,
    /// Local root for everything not addressed by the release.
    pub work_path: PathBuf,
    /// Release root URI; absent means a local-only run.
    pub release_uri: Option<String>,
    /// Worker pool size, at least 1.
    pub pool_size: usize,
    pub log_level: LogLevel,
    /// Namespace for this runner's slots in the root manifest.
    pub runner_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step: String::new(),
            steps: Vec::new(),
            config_path: PathBuf::from("config.yaml"),
            work_path: PathBuf::from(DEFAULT_WORK_PATH),
            release_uri: None,
            pool_size: DEFAULT_POOL_SIZE,
            log_level: LogLevel::default(),
            runner_name: DEFAULT_RUNNER_NAME.to_string(),
        }
    }
}

impl Config {
    /// Resolve the effective configuration for a step from a loaded file
    /// and CLI overrides.
    pub fn resolve(
        step: &str,
        config_path: &Path,
        file: &ConfigFile,
        overrides: &Overrides,
    ) -> Result<Self> {
        if !file.steps.is_empty() && !file.steps.contains_key(step) {
            return Err(ConfigError::UnknownStep(step.to_string()));
        }

        let pool_size = overrides
            .pool_size
            .or(file.pool_size)
            .unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }

        let release_uri = overrides
            .release_uri
            .clone()
            .or_else(|| file.release_uri.clone())
            .map(|uri| uri.trim_end_matches('/').to_string());

        let steps = if file.steps.is_empty() {
            vec![step.to_string()]
        } else {
            file.step_names()
        };

        Ok(Self {
            step: step.to_string(),
            steps,
            config_path: config_path.to_path_buf(),
            work_path: overrides
                .work_path
                .clone()
                .or_else(|| file.work_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_PATH)),
            release_uri,
            pool_size,
            log_level: overrides.log_level.or(file.log_level).unwrap_or_default(),
            runner_name: overrides
                .runner_name
                .clone()
                .or_else(|| file.runner_name.clone())
                .unwrap_or_else(|| DEFAULT_RUNNER_NAME.to_string()),
        })
    }

    /// Display form of the work path for URI assembly.
    pub fn work_path_str(&self) -> String {
        self.work_path.display().to_string()
    }
}
