//! CLI command definitions for sweval.
//!
//! Three commands: `run` evaluates a predictions file against a dataset,
//! `build-images` pre-builds the image hierarchy, and `clean-containers`
//! removes leftovers from an interrupted run.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use uuid::Uuid;

use crate::build;
use crate::docker::{clean_containers, CacheLevel, DockerClient};
use crate::error::ConfigurationError;
use crate::run::predictions::{gold_predictions, load_dataset, load_predictions};
use crate::run::{run_evaluation, RunConfig, RunPaths};
use crate::specs::{make_test_spec, InstallSpecTable, TaskInstance, TestSpec};

/// Default wall-clock budget for one instance's test run.
const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Evaluation harness: rebuild repo environments in Docker, apply candidate
/// patches, and grade test outcomes.
#[derive(Parser)]
#[command(name = "sweval")]
#[command(about = "Evaluate candidate patches against repo test suites in Docker")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Evaluate a predictions file against a dataset.
    Run(RunArgs),

    /// Pre-build base, environment, and instance images for a dataset.
    #[command(name = "build-images")]
    BuildImages(BuildImagesArgs),

    /// Remove containers left behind by an interrupted run.
    #[command(name = "clean-containers")]
    CleanContainers(CleanContainersArgs),
}

/// Arguments for `sweval run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Predictions file (JSON array or JSONL), or the literal "gold" to
    /// evaluate the dataset's own patches.
    #[arg(long)]
    pub predictions_path: String,

    /// Task dataset file (JSON array or JSONL).
    #[arg(long)]
    pub dataset_path: PathBuf,

    /// Evaluate only these instance ids (repeatable).
    #[arg(long = "instance-id")]
    pub instance_ids: Vec<String>,

    /// Identifier for this run; defaults to a generated id.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Per-instance test timeout, in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Maximum concurrent builds/instances.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Which image tiers to keep after the run (none, base, env, instance).
    #[arg(long, default_value = "env")]
    pub cache_level: CacheLevel,

    /// Also remove matching images that existed before the run.
    #[arg(long)]
    pub clean: bool,

    /// Rebuild images even when current.
    #[arg(long)]
    pub force_rebuild: bool,

    /// Root directory for build and run artifacts.
    #[arg(long, default_value = "logs")]
    pub logs_dir: PathBuf,

    /// JSON file overriding or extending the built-in install table.
    #[arg(long)]
    pub install_overrides: Option<PathBuf>,
}

/// Arguments for `sweval build-images`.
#[derive(Parser, Debug)]
pub struct BuildImagesArgs {
    /// Task dataset file (JSON array or JSONL).
    #[arg(long)]
    pub dataset_path: PathBuf,

    /// Build only these instance ids (repeatable).
    #[arg(long = "instance-id")]
    pub instance_ids: Vec<String>,

    /// Rebuild images even when current.
    #[arg(long)]
    pub force_rebuild: bool,

    /// Maximum concurrent builds.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Root directory for build artifacts.
    #[arg(long, default_value = "logs")]
    pub logs_dir: PathBuf,

    /// JSON file overriding or extending the built-in install table.
    #[arg(long)]
    pub install_overrides: Option<PathBuf>,
}

/// Arguments for `sweval clean-containers`.
#[derive(Parser, Debug)]
pub struct CleanContainersArgs {
    /// Only remove containers belonging to this run id.
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and executes the selected command.
pub async fn run() -> Result<()> {
    run_with_cli(parse_cli()).await
}

/// Executes a pre-parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await?,
        Commands::BuildImages(args) => run_build_images_command(args).await?,
        Commands::CleanContainers(args) => run_clean_containers_command(args).await?,
    }
    Ok(())
}

fn load_install_table(overrides: Option<&PathBuf>) -> Result<InstallSpecTable> {
    match overrides {
        Some(path) => InstallSpecTable::with_overrides(path)
            .with_context(|| format!("loading install overrides from {}", path.display())),
        None => Ok(InstallSpecTable::builtin()),
    }
}

/// Resolves the dataset subset named by an instance-id filter.
fn filter_dataset(
    dataset: &[TaskInstance],
    instance_ids: &[String],
) -> Result<Vec<TaskInstance>, ConfigurationError> {
    if instance_ids.is_empty() {
        return Ok(dataset.to_vec());
    }
    let known: HashSet<&str> = dataset.iter().map(|i| i.instance_id.as_str()).collect();
    let mut missing: Vec<&str> = instance_ids
        .iter()
        .map(String::as_str)
        .filter(|id| !known.contains(id))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(ConfigurationError::MissingInstances(missing.join(", ")));
    }
    let wanted: HashSet<&str> = instance_ids.iter().map(String::as_str).collect();
    Ok(dataset
        .iter()
        .filter(|i| wanted.contains(i.instance_id.as_str()))
        .cloned()
        .collect())
}

fn specs_for(dataset: &[TaskInstance], table: &InstallSpecTable) -> Vec<TestSpec> {
    let mut specs = Vec::with_capacity(dataset.len());
    for instance in dataset {
        match make_test_spec(instance, table) {
            Ok(spec) => specs.push(spec),
            Err(e) => error!(instance_id = %instance.instance_id, "cannot build spec: {e}"),
        }
    }
    specs
}

async fn run_run_command(args: RunArgs) -> Result<()> {
    let table = load_install_table(args.install_overrides.as_ref())?;
    let dataset = load_dataset(&args.dataset_path)
        .with_context(|| format!("loading dataset from {}", args.dataset_path.display()))?;

    let predictions = if args.predictions_path == "gold" {
        info!("using gold predictions from the dataset");
        gold_predictions(&dataset)
    } else {
        load_predictions(&PathBuf::from(&args.predictions_path))?
    };

    let run_id = args
        .run_id
        .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));

    let client = DockerClient::new()?;
    client.ping().await?;

    let config = RunConfig {
        run_id,
        timeout: Duration::from_secs(args.timeout),
        workers: args.workers,
        cache_level: args.cache_level,
        clean: args.clean,
        force_rebuild: args.force_rebuild,
        logs_root: args.logs_dir,
    };
    run_evaluation(
        &client,
        &dataset,
        &predictions,
        &args.instance_ids,
        &table,
        &config,
    )
    .await?;
    Ok(())
}

async fn run_build_images_command(args: BuildImagesArgs) -> Result<()> {
    let table = load_install_table(args.install_overrides.as_ref())?;
    let dataset = load_dataset(&args.dataset_path)
        .with_context(|| format!("loading dataset from {}", args.dataset_path.display()))?;
    let dataset = filter_dataset(&dataset, &args.instance_ids)?;
    let specs = specs_for(&dataset, &table);

    let client = DockerClient::new()?;
    client.ping().await?;

    let paths = RunPaths::new(&args.logs_dir);
    let outcome = build::build_instance_images(
        &client,
        &specs,
        args.force_rebuild,
        args.workers,
        &paths.build_root(),
    )
    .await?;
    info!(
        successful = outcome.successful.len(),
        failed = outcome.failed.len(),
        "image build finished"
    );
    for image in &outcome.failed {
        error!(image = %image, "build failed");
    }
    Ok(())
}

async fn run_clean_containers_command(args: CleanContainersArgs) -> Result<()> {
    let client = DockerClient::new()?;
    client.ping().await?;

    let removed = clean_containers(&client, args.run_id.as_deref()).await?;
    info!(removed, "containers cleaned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> TaskInstance {
        TaskInstance {
            instance_id: id.to_string(),
            repo: "pallets/flask".to_string(),
            version: "2.0".to_string(),
            base_commit: "abc".to_string(),
            patch: String::new(),
            test_patch: String::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
        }
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "sweval",
            "run",
            "--predictions-path",
            "gold",
            "--dataset-path",
            "dataset.json",
            "--instance-id",
            "a-1",
            "--cache-level",
            "none",
            "--clean",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.predictions_path, "gold");
                assert_eq!(args.instance_ids, vec!["a-1"]);
                assert_eq!(args.cache_level, CacheLevel::None);
                assert!(args.clean);
                assert_eq!(args.timeout, DEFAULT_TIMEOUT_SECS);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_cache_level() {
        let result = Cli::try_parse_from([
            "sweval",
            "run",
            "--predictions-path",
            "gold",
            "--dataset-path",
            "d.json",
            "--cache-level",
            "everything",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_filter_dataset_unknown_id() {
        let dataset = vec![instance("a-1")];
        let err = filter_dataset(&dataset, &["b-2".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingInstances(_)));
    }

    #[test]
    fn test_filter_dataset_subset() {
        let dataset = vec![instance("a-1"), instance("a-2")];
        let subset = filter_dataset(&dataset, &["a-2".to_string()]).unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].instance_id, "a-2");
    }
}
