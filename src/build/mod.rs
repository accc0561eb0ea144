//! Tiered image building.
//!
//! Images form a three-level hierarchy: one base image per architecture, an
//! environment image per (repo, version, arch, setup-script digest), and an
//! instance image per task. Lower tiers are always current before a higher
//! tier builds, and every build streams its output to a per-image log file
//! under the build log root.

pub mod plan;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::docker::DockerClient;
use crate::error::BuildImageError;
use crate::specs::test_spec::ImageTier;
use crate::specs::TestSpec;

use plan::{plan_images, ImageRequest};

pub use plan::BuildPlan;

/// Outcome of a batch build: image tags that are now present, and tags whose
/// build failed.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
}

impl BuildOutcome {
    fn sort(mut self) -> Self {
        self.successful.sort();
        self.failed.sort();
        self
    }
}

/// One image to build: its tag, tier, platform, and the files of its build
/// context (`Dockerfile` plus the scripts it copies in).
#[derive(Debug, Clone)]
struct ImageBuildJob {
    tag: String,
    tier: ImageTier,
    platform: String,
    files: Vec<(String, String)>,
}

impl ImageBuildJob {
    fn base(spec: &TestSpec) -> Self {
        Self {
            tag: spec.base_image_key.clone(),
            tier: ImageTier::Base,
            platform: spec.platform.clone(),
            files: vec![("Dockerfile".to_string(), spec.base_dockerfile.clone())],
        }
    }

    fn env(spec: &TestSpec) -> Self {
        Self {
            tag: spec.env_image_key.clone(),
            tier: ImageTier::Env,
            platform: spec.platform.clone(),
            files: vec![
                ("Dockerfile".to_string(), spec.env_dockerfile.clone()),
                ("setup_env.sh".to_string(), spec.setup_env_script.clone()),
            ],
        }
    }

    fn instance(spec: &TestSpec) -> Self {
        Self {
            tag: spec.instance_image_key.clone(),
            tier: ImageTier::Instance,
            platform: spec.platform.clone(),
            files: vec![
                ("Dockerfile".to_string(), spec.instance_dockerfile.clone()),
                (
                    "setup_repo.sh".to_string(),
                    spec.install_repo_script.clone(),
                ),
            ],
        }
    }
}

fn tier_dir(tier: ImageTier) -> &'static str {
    match tier {
        ImageTier::Base => "base",
        ImageTier::Env => "env",
        ImageTier::Instance => "instance",
    }
}

/// Directory holding one image's build context and streamed log.
fn image_build_dir(build_log_root: &Path, tier: ImageTier, tag: &str) -> PathBuf {
    build_log_root
        .join(tier_dir(tier))
        .join(tag.replace([':', '/'], "__"))
}

/// Path of the streamed build log for an image.
pub fn build_log_path(build_log_root: &Path, tier: ImageTier, tag: &str) -> PathBuf {
    image_build_dir(build_log_root, tier, tag).join("build_image.log")
}

/// Builds one image: writes its context files to the build directory, then
/// streams the engine build into `build_image.log` alongside them.
async fn build_one(
    client: &DockerClient,
    job: &ImageBuildJob,
    build_log_root: &Path,
) -> Result<(), BuildImageError> {
    let dir = image_build_dir(build_log_root, job.tier, &job.tag);
    let log_path = dir.join("build_image.log");
    let io_err = |e: std::io::Error| {
        BuildImageError::new(&job.tag, format!("prepare context: {e}"), log_path.clone())
    };

    std::fs::create_dir_all(&dir).map_err(io_err)?;
    for (name, contents) in &job.files {
        std::fs::write(dir.join(name), contents).map_err(io_err)?;
    }

    info!(image = %job.tag, "building image");
    client
        .build_image(&job.tag, &job.platform, &dir, &log_path)
        .await
}

/// Runs a set of build jobs with bounded parallelism.
async fn run_jobs(
    client: &DockerClient,
    jobs: Vec<ImageBuildJob>,
    max_workers: usize,
    build_log_root: &Path,
) -> BuildOutcome {
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut set: JoinSet<(String, Result<(), BuildImageError>)> = JoinSet::new();

    for job in jobs {
        let client = client.clone();
        let semaphore = Arc::clone(&semaphore);
        let root = build_log_root.to_path_buf();
        set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        job.tag.clone(),
                        Err(BuildImageError::new(
                            &job.tag,
                            "build pool shut down",
                            PathBuf::new(),
                        )),
                    )
                }
            };
            let result = build_one(&client, &job, &root).await;
            (job.tag, result)
        });
    }

    let mut outcome = BuildOutcome::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((tag, Ok(()))) => outcome.successful.push(tag),
            Ok((tag, Err(e))) => {
                error!("{e}");
                outcome.failed.push(tag);
            }
            Err(e) => error!("build task panicked: {e}"),
        }
    }
    outcome.sort()
}

/// Deduplicates jobs by tag, keeping first occurrence order.
fn dedup_jobs(jobs: impl IntoIterator<Item = ImageBuildJob>) -> Vec<ImageBuildJob> {
    let mut seen = HashSet::new();
    jobs.into_iter()
        .filter(|job| seen.insert(job.tag.clone()))
        .collect()
}

/// Snapshot of creation times for the given tags, omitting absent images.
async fn snapshot_created(
    client: &DockerClient,
    tags: impl IntoIterator<Item = String>,
) -> Result<HashMap<String, DateTime<Utc>>> {
    let mut snapshot = HashMap::new();
    for tag in tags {
        if let Some(created) = client
            .image_created(&tag)
            .await
            .with_context(|| format!("inspecting image {tag}"))?
        {
            snapshot.insert(tag, created);
        }
    }
    Ok(snapshot)
}

/// Removes images built on top of `tag` before it is rebuilt, so no stale
/// descendant survives with layers from the replaced image.
async fn remove_dependents(client: &DockerClient, tag: &str) {
    let dependents = match client.find_dependent_images(tag).await {
        Ok(dependents) => dependents,
        Err(e) => {
            warn!(image = tag, "could not enumerate dependent images: {e}");
            return;
        }
    };
    for dependent in dependents {
        info!(image = %dependent, parent = tag, "removing stale dependent image");
        if let Err(e) = client.remove_image(&dependent).await {
            warn!(image = %dependent, "failed to remove stale image: {e}");
        }
    }
}

/// Planned-to-build tags that already exist locally. These must be removed
/// before the rebuild, or the replaced image lingers untagged and escapes
/// every cache level.
fn tags_to_replace<'a>(
    plan: &'a BuildPlan,
    snapshot: &HashMap<String, DateTime<Utc>>,
) -> Vec<&'a str> {
    plan.to_build
        .iter()
        .filter(|tag| snapshot.contains_key(*tag))
        .map(String::as_str)
        .collect()
}

/// Removes an image that is about to be rebuilt, along with any images built
/// on top of it.
async fn remove_replaced(client: &DockerClient, tag: &str) {
    remove_dependents(client, tag).await;
    info!(image = tag, "removing image before rebuild");
    if let Err(e) = client.remove_image(tag).await {
        warn!(image = tag, "failed to remove image before rebuild: {e}");
    }
}

/// Builds the base images the given specs need.
///
/// Base images carry no per-task content, so there is usually exactly one
/// per architecture. A failed base build is fatal for the whole batch.
pub async fn build_base_images(
    client: &DockerClient,
    specs: &[TestSpec],
    force_rebuild: bool,
    max_workers: usize,
    build_log_root: &Path,
) -> Result<BuildOutcome> {
    let jobs = dedup_jobs(specs.iter().map(ImageBuildJob::base));
    let snapshot = snapshot_created(client, jobs.iter().map(|j| j.tag.clone())).await?;
    let requests: Vec<ImageRequest> = jobs
        .iter()
        .map(|j| ImageRequest::base(j.tag.clone()))
        .collect();
    let plan = plan_images(&snapshot, &requests, force_rebuild);

    for tag in tags_to_replace(&plan, &snapshot) {
        remove_replaced(client, tag).await;
    }

    let to_build: Vec<ImageBuildJob> = jobs
        .into_iter()
        .filter(|j| plan.to_build.contains(&j.tag))
        .collect();
    let mut outcome = run_jobs(client, to_build, max_workers, build_log_root).await;
    outcome.successful.extend(plan.up_to_date);
    Ok(outcome.sort())
}

/// Builds the environment images the given specs need, after making sure
/// their base images are current.
///
/// Environment images sharing a failed base are reported failed without
/// being attempted. Returns the outcome for the environment tier only.
pub async fn build_env_images(
    client: &DockerClient,
    specs: &[TestSpec],
    force_rebuild: bool,
    max_workers: usize,
    build_log_root: &Path,
) -> Result<BuildOutcome> {
    let base = build_base_images(client, specs, force_rebuild, max_workers, build_log_root).await?;
    let failed_bases: HashSet<&String> = base.failed.iter().collect();

    let jobs = dedup_jobs(specs.iter().map(ImageBuildJob::env));

    // Pair each env image with its base for staleness planning.
    let mut parent_of: HashMap<String, String> = HashMap::new();
    for spec in specs {
        parent_of
            .entry(spec.env_image_key.clone())
            .or_insert_with(|| spec.base_image_key.clone());
    }

    let mut outcome = BuildOutcome::default();
    let mut buildable = Vec::new();
    for job in jobs {
        match parent_of.get(&job.tag) {
            Some(parent) if failed_bases.contains(parent) => {
                warn!(image = %job.tag, "skipping env build, base image failed");
                outcome.failed.push(job.tag);
            }
            _ => buildable.push(job),
        }
    }

    let all_tags: Vec<String> = buildable
        .iter()
        .map(|j| j.tag.clone())
        .chain(parent_of.values().cloned())
        .collect();
    let snapshot = snapshot_created(client, all_tags).await?;

    let mut requests: Vec<ImageRequest> = parent_of
        .values()
        .collect::<HashSet<_>>()
        .into_iter()
        .map(ImageRequest::base)
        .collect();
    requests.extend(buildable.iter().map(|j| {
        let parent = parent_of
            .get(&j.tag)
            .cloned()
            .unwrap_or_else(|| j.tag.clone());
        ImageRequest::child(j.tag.clone(), parent)
    }));
    let plan = plan_images(&snapshot, &requests, force_rebuild);

    for tag in tags_to_replace(&plan, &snapshot) {
        remove_replaced(client, tag).await;
    }

    let to_build: Vec<ImageBuildJob> = buildable
        .iter()
        .filter(|j| plan.to_build.contains(&j.tag))
        .cloned()
        .collect();
    let up_to_date: Vec<String> = buildable
        .iter()
        .map(|j| j.tag.clone())
        .filter(|tag| !plan.to_build.contains(tag))
        .collect();
    info!(
        total = buildable.len(),
        building = to_build.len(),
        "environment images planned"
    );

    let built = run_jobs(client, to_build, max_workers, build_log_root).await;
    outcome.successful.extend(built.successful);
    outcome.successful.extend(up_to_date);
    outcome.failed.extend(built.failed);
    Ok(outcome.sort())
}

/// Builds instance images for every spec, after the environment tier.
///
/// Instances whose environment image failed are reported failed without
/// being attempted.
pub async fn build_instance_images(
    client: &DockerClient,
    specs: &[TestSpec],
    force_rebuild: bool,
    max_workers: usize,
    build_log_root: &Path,
) -> Result<BuildOutcome> {
    let env = build_env_images(client, specs, force_rebuild, max_workers, build_log_root).await?;
    let failed_envs: HashSet<&String> = env.failed.iter().collect();

    let mut outcome = BuildOutcome::default();
    let mut buildable = Vec::new();
    let mut parent_of: HashMap<String, String> = HashMap::new();
    for spec in specs {
        if failed_envs.contains(&spec.env_image_key) {
            warn!(image = %spec.instance_image_key, "skipping instance build, env image failed");
            outcome.failed.push(spec.instance_image_key.clone());
            continue;
        }
        parent_of.insert(spec.instance_image_key.clone(), spec.env_image_key.clone());
        buildable.push(ImageBuildJob::instance(spec));
    }
    let buildable = dedup_jobs(buildable);

    let all_tags: Vec<String> = buildable
        .iter()
        .map(|j| j.tag.clone())
        .chain(parent_of.values().cloned())
        .collect();
    let snapshot = snapshot_created(client, all_tags).await?;

    let mut requests: Vec<ImageRequest> = parent_of
        .values()
        .collect::<HashSet<_>>()
        .into_iter()
        .map(ImageRequest::base)
        .collect();
    requests.extend(buildable.iter().map(|j| {
        let parent = parent_of
            .get(&j.tag)
            .cloned()
            .unwrap_or_else(|| j.tag.clone());
        ImageRequest::child(j.tag.clone(), parent)
    }));
    let plan = plan_images(&snapshot, &requests, force_rebuild);

    for tag in tags_to_replace(&plan, &snapshot) {
        remove_replaced(client, tag).await;
    }

    let to_build: Vec<ImageBuildJob> = buildable
        .iter()
        .filter(|j| plan.to_build.contains(&j.tag))
        .cloned()
        .collect();
    let up_to_date: Vec<String> = buildable
        .iter()
        .map(|j| j.tag.clone())
        .filter(|tag| !plan.to_build.contains(tag))
        .collect();

    let built = run_jobs(client, to_build, max_workers, build_log_root).await;
    outcome.successful.extend(built.successful);
    outcome.successful.extend(up_to_date);
    outcome.failed.extend(built.failed);
    Ok(outcome.sort())
}

/// Builds (or reuses) the instance image for a single spec. Used on the run
/// path, where instance images are built lazily just before the container
/// starts.
pub async fn build_instance_image(
    client: &DockerClient,
    spec: &TestSpec,
    force_rebuild: bool,
    build_log_root: &Path,
) -> Result<(), BuildImageError> {
    let log_path = build_log_path(build_log_root, ImageTier::Instance, &spec.instance_image_key);
    let docker_err = |e: crate::error::DockerError| {
        BuildImageError::new(&spec.instance_image_key, e.to_string(), log_path.clone())
    };

    let parent = client
        .image_created(&spec.env_image_key)
        .await
        .map_err(docker_err)?;
    let Some(parent) = parent else {
        return Err(BuildImageError::new(
            &spec.instance_image_key,
            format!(
                "environment image {} not found, build env images first",
                spec.env_image_key
            ),
            log_path.clone(),
        ));
    };

    let own = client
        .image_created(&spec.instance_image_key)
        .await
        .map_err(docker_err)?;
    if let Some(own) = own {
        if !force_rebuild && own >= parent {
            info!(image = %spec.instance_image_key, "instance image already current");
            return Ok(());
        }
        remove_replaced(client, &spec.instance_image_key).await;
    }

    build_one(client, &ImageBuildJob::instance(spec), build_log_root).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_build_dir_sanitizes_tag() {
        let dir = image_build_dir(
            Path::new("logs/build"),
            ImageTier::Env,
            "sweval.env.flask.2.0.x86_64.abcd1234:latest",
        );
        assert_eq!(
            dir,
            Path::new("logs/build/env/sweval.env.flask.2.0.x86_64.abcd1234__latest")
        );
    }

    #[test]
    fn test_dedup_jobs_keeps_first() {
        let job = |tag: &str| ImageBuildJob {
            tag: tag.to_string(),
            tier: ImageTier::Base,
            platform: "linux/x86_64".to_string(),
            files: Vec::new(),
        };
        let jobs = dedup_jobs(vec![job("a"), job("b"), job("a")]);
        let tags: Vec<&str> = jobs.iter().map(|j| j.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn test_existing_images_are_replaced_before_rebuild() {
        let plan = BuildPlan {
            to_build: vec![
                "sweval.base.x86_64:latest".to_string(),
                "sweval.env.flask.2.2.x86_64.abcd1234:latest".to_string(),
            ],
            up_to_date: vec!["sweval.env.other.1.0.x86_64.ffff0000:latest".to_string()],
        };
        let mut snapshot = HashMap::new();
        snapshot.insert("sweval.base.x86_64:latest".to_string(), Utc::now());
        snapshot.insert(
            "sweval.env.other.1.0.x86_64.ffff0000:latest".to_string(),
            Utc::now(),
        );

        // Only existing images planned for rebuild are removed first; fresh
        // builds have nothing to replace and up-to-date images are untouched.
        assert_eq!(
            tags_to_replace(&plan, &snapshot),
            vec!["sweval.base.x86_64:latest"]
        );
    }
}
