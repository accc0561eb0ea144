//! Run orchestration: fans per-instance evaluations across a bounded
//! concurrency budget, then applies cache cleanup and writes the run report.

pub mod instance;
pub mod logger;
pub mod predictions;
pub mod report;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::build;
use crate::docker::{clean_images, CacheLevel, DockerClient};
use crate::error::ConfigurationError;
use crate::specs::{make_test_spec, InstallSpec, InstallSpecTable, Prediction, TaskInstance, TestSpec};

pub use instance::{run_instance, InstanceState};
pub use report::{make_run_report, write_run_report, RunReport};

/// On-disk artifact layout for one logs root.
///
/// Per-instance artifacts live under `run/<model>/<instance_id>/`, per-image
/// build logs under `build/<tier>/<image>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    logs_root: PathBuf,
}

impl RunPaths {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
        }
    }

    /// Root of the per-image build directories.
    pub fn build_root(&self) -> PathBuf {
        self.logs_root.join("build")
    }

    /// Directory holding one instance's patch, logs, output, and report.
    pub fn instance_dir(&self, model: &str, instance_id: &str) -> PathBuf {
        self.logs_root.join("run").join(model).join(instance_id)
    }

    pub fn report_path(&self, model: &str, instance_id: &str) -> PathBuf {
        self.instance_dir(model, instance_id).join("report.json")
    }
}

/// Settings for one evaluation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    pub timeout: Duration,
    pub workers: usize,
    pub cache_level: CacheLevel,
    pub clean: bool,
    pub force_rebuild: bool,
    pub logs_root: PathBuf,
}

/// Run ids end up in container names, so they are restricted to the
/// character set Docker accepts there.
pub fn validate_run_id(run_id: &str) -> Result<(), ConfigurationError> {
    let ok = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidRunId(run_id.to_string()))
    }
}

/// Evaluates every predicted instance and returns the aggregated run report.
///
/// Instances with an existing report are skipped, empty patches are
/// classified without touching Docker, and one instance's failure never
/// stops its siblings. Always finishes with image cleanup and a run report,
/// even when every instance errored.
pub async fn run_evaluation(
    client: &DockerClient,
    dataset: &[TaskInstance],
    predictions: &std::collections::HashMap<String, Prediction>,
    instance_ids: &[String],
    table: &InstallSpecTable,
    config: &RunConfig,
) -> Result<RunReport> {
    validate_run_id(&config.run_id)?;
    let Some(model) = predictions.values().next().map(Prediction::model_dir_name) else {
        bail!("predictions are empty, nothing to evaluate");
    };
    let paths = RunPaths::new(&config.logs_root);

    let selected = predictions::select_instances(dataset, predictions, instance_ids)?;
    info!(
        selected = selected.len(),
        run_id = %config.run_id,
        "starting evaluation"
    );

    // Classify up front: empty patches and finished instances never reach
    // the build or container stages.
    let mut jobs: Vec<(TestSpec, Prediction, InstallSpec)> = Vec::new();
    let mut skipped_done = 0usize;
    let mut skipped_empty = 0usize;
    for instance in &selected {
        let prediction = &predictions[&instance.instance_id];
        if prediction.is_empty_patch() {
            info!(instance_id = %instance.instance_id, "empty patch, skipping");
            skipped_empty += 1;
            continue;
        }
        if paths
            .report_path(&prediction.model_dir_name(), &instance.instance_id)
            .exists()
        {
            skipped_done += 1;
            continue;
        }
        match make_test_spec(instance, table) {
            Ok(spec) => {
                // Known to exist, make_test_spec resolved the same key.
                let install = table.get(&instance.repo, &instance.version)?.clone();
                jobs.push((spec, prediction.clone(), install));
            }
            Err(e) => error!(instance_id = %instance.instance_id, "cannot build spec: {e}"),
        }
    }
    info!(
        to_run = jobs.len(),
        already_done = skipped_done,
        empty_patch = skipped_empty,
        "instances classified"
    );

    let prior_images: HashSet<String> = client
        .list_harness_images()
        .await
        .context("listing existing images")?
        .into_iter()
        .flat_map(|image| image.tags)
        .collect();

    let specs: Vec<TestSpec> = jobs.iter().map(|(spec, _, _)| spec.clone()).collect();
    let env = build::build_env_images(
        client,
        &specs,
        config.force_rebuild,
        config.workers,
        &paths.build_root(),
    )
    .await?;
    if !env.failed.is_empty() {
        warn!(
            failed = env.failed.len(),
            "some environment images failed to build; their instances will error"
        );
    }

    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut set: JoinSet<()> = JoinSet::new();
    for (spec, prediction, install) in jobs {
        let client = client.clone();
        let semaphore = Arc::clone(&semaphore);
        let paths = paths.clone();
        let run_id = config.run_id.clone();
        let timeout = config.timeout;
        let force_rebuild = config.force_rebuild;
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            match run_instance(
                &client,
                &spec,
                &prediction,
                &install,
                &paths,
                &run_id,
                timeout,
                force_rebuild,
            )
            .await
            {
                Ok(report) => info!(
                    instance_id = %spec.instance_id,
                    resolved = report.resolved,
                    "instance evaluated"
                ),
                Err(e) => error!("{e}"),
            }
        });
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!("instance task panicked: {e}");
        }
    }

    match clean_images(client, &prior_images, config.cache_level, config.clean).await {
        Ok(removed) => info!(removed, cache_level = %config.cache_level, "image cleanup done"),
        Err(e) => warn!("image cleanup failed: {e}"),
    }

    let report = make_run_report(dataset, predictions, &paths);
    write_run_report(&report, &model, &config.run_id)?;
    Ok(report)
}
