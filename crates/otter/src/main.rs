//! otter - reproducible release step runner.
//!
//! Binary entry point: load config, run the step's coordinator, publish
//! the manifest, and exit with an errno-shaped code on failure.

use clap::Parser;
use otter::coordinator::{Coordinator, StepError};
use otter::manifest_manager::{ManifestError, ManifestManager};
use otter::registry::{BuildError, TaskRegistry};
use otter::step::Step;
use otter::storage::StorageError;
use otter::{fs, tasks};
use otter_core::{Config, ConfigError, ConfigFile, LogLevel, Outcome, Overrides};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Env var overriding the configured log filter.
const LOG_ENV: &str = "OTTER_LOG";

/// Run a step against a release.
#[derive(Debug, Parser)]
#[command(name = "otter")]
#[command(about = "Run a step of tasks and publish the results to a release")]
#[command(version)]
struct Cli {
    /// Step to run
    #[arg(short, long)]
    step: String,

    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Local work directory
    #[arg(short, long)]
    work_path: Option<PathBuf>,

    /// Release URI to publish into (local-only run when absent)
    #[arg(long)]
    release_uri: Option<String>,

    /// Worker pool size
    #[arg(long)]
    pool_size: Option<usize>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Namespace for this runner's slots in the root manifest
    #[arg(long)]
    runner_name: Option<String>,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fs(#[from] fs::FsError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl RunError {
    /// Errno-shaped exit codes: I/O errors land in the 5 family, invalid
    /// manifests and config map to 22, a missing task module to 2.
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(ConfigError::Read(_)) => 5,
            Self::Config(_) => 22,
            Self::Fs(_) => 5,
            Self::Step(StepError::TaskBuild {
                source: BuildError::UnknownTaskType(_),
                ..
            }) => 2,
            Self::Step(_) => 1,
            Self::Manifest(ManifestError::Storage(StorageError::NotFound(_))) => 2,
            Self::Manifest(ManifestError::Storage(_)) => 5,
            Self::Manifest(_) => 22,
        }
    }
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    fmt().with_env_filter(filter).init();
}

async fn execute(cli: Cli, shutdown: CancellationToken) -> Result<Outcome, RunError> {
    let file = ConfigFile::load(&cli.config)?;
    let overrides = Overrides {
        work_path: cli.work_path,
        release_uri: cli.release_uri,
        pool_size: cli.pool_size,
        log_level: cli.log_level,
        runner_name: cli.runner_name,
    };
    let config = Config::resolve(&cli.step, &cli.config, &file, &overrides)?;
    init_logging(config.log_level);
    info!(step = %config.step, work_path = %config.work_path.display(), "starting run");

    fs::check_dir(&config.work_path)?;
    let specs = file.specs_for(&config.step)?;

    let config = Arc::new(config);
    let mut registry = TaskRegistry::new(Arc::clone(&config), file.scratchpad());
    tasks::register_builtins(&mut registry);

    let step = Step::new(config.step.clone(), specs);
    let coordinator =
        Coordinator::with_shutdown(step, registry, Arc::clone(&config), shutdown);
    let (step, result) = coordinator.run().await;

    // publish the manifest even for a failed step, so the failure is
    // visible in the release
    let manager = ManifestManager::new(Arc::clone(&config));
    manager.update(step.manifest.clone()).await?;

    result?;
    Ok(step.manifest.result)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT");
                signal.cancel();
            }
        });

        match execute(cli, shutdown).await {
            Ok(Outcome::Success) => 0,
            Ok(outcome) => {
                error!(outcome = outcome.as_str(), "run did not succeed");
                1
            }
            Err(e) => {
                error!(error = %e, "run failed");
                e.exit_code()
            }
        }
    });

    ExitCode::from(code)
}
