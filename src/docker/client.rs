//! Docker API wrapper using the bollard crate.
//!
//! This module provides a high-level interface to the Docker engine for
//! image builds, image queries, container lifecycle, and command execution.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BuildImageError, DockerError};

/// Prefix shared by every image this harness builds. Used to scope image
/// listings so retention never touches unrelated images.
pub const IMAGE_PREFIX: &str = "sweval.";

/// A locally present image, as seen by the retention and staleness logic.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Content-addressed image ID (`sha256:...`).
    pub id: String,
    /// Repo tags attached to this image.
    pub tags: Vec<String>,
    /// Creation time reported by the engine.
    pub created: DateTime<Utc>,
}

/// Result of executing a command in a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr, in arrival order.
    pub output: String,
    /// Exit code of the command. `-1` when the command timed out.
    pub exit_code: i64,
    /// Whether the command was cut off by the timeout.
    pub timed_out: bool,
    /// Wall-clock duration of the exec.
    pub duration: Duration,
}

/// Docker client wrapper for harness operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pings the daemon, verifying it is reachable before any work starts.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(format!("Ping failed: {e}")))?;
        Ok(())
    }

    /// Checks whether an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Returns the creation time of an image, or `None` if it is absent.
    ///
    /// The engine reports creation time as an RFC 3339 string; an image whose
    /// timestamp cannot be parsed is treated as absent so it gets rebuilt.
    pub async fn image_created(&self, image: &str) -> Result<Option<DateTime<Utc>>, DockerError> {
        let inspect = match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(DockerError::Api(e)),
        };

        let created = inspect
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        if created.is_none() {
            warn!(image, "image has no parseable creation time, treating as absent");
        }
        Ok(created)
    }

    /// Lists all images whose tags carry the harness prefix.
    pub async fn list_harness_images(&self) -> Result<Vec<ImageInfo>, DockerError> {
        let options = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self.docker.list_images(Some(options)).await?;
        let mut images = Vec::new();
        for summary in summaries {
            let tags: Vec<String> = summary
                .repo_tags
                .iter()
                .filter(|t| t.starts_with(IMAGE_PREFIX))
                .cloned()
                .collect();
            if tags.is_empty() {
                continue;
            }
            images.push(ImageInfo {
                id: summary.id,
                tags,
                created: DateTime::from_timestamp(summary.created, 0).unwrap_or_default(),
            });
        }
        Ok(images)
    }

    /// Finds harness images whose layer history contains the given image,
    /// i.e. the images built on top of it.
    pub async fn find_dependent_images(&self, image: &str) -> Result<Vec<String>, DockerError> {
        let inspect = match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(Vec::new()),
            Err(e) => return Err(DockerError::Api(e)),
        };
        let base_id = match inspect.id {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };

        let mut dependents = Vec::new();
        for info in self.list_harness_images().await? {
            if info.id == base_id {
                continue;
            }
            let Some(tag) = info.tags.first() else {
                continue;
            };
            let history = self.docker.image_history(tag).await?;
            if history.iter().any(|layer| layer.id == base_id) {
                dependents.extend(info.tags);
            }
        }
        Ok(dependents)
    }

    /// Removes an image, forcing removal of its tags.
    pub async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_image(image, Some(options), None).await?;
        Ok(())
    }

    /// Builds an image from a prepared build directory, streaming the build
    /// output to `log_path` with ANSI escapes stripped.
    ///
    /// The directory must contain a `Dockerfile` plus any files it copies in.
    /// On failure the returned error names the log file so the build can be
    /// diagnosed without rerunning it.
    pub async fn build_image(
        &self,
        tag: &str,
        platform: &str,
        build_dir: &Path,
        log_path: &Path,
    ) -> Result<(), BuildImageError> {
        let fail = |message: String| BuildImageError::new(tag, message, log_path.to_path_buf());

        let context = tar_directory(build_dir).map_err(|e| fail(format!("tar context: {e}")))?;
        let mut log = std::fs::File::create(log_path)
            .map_err(|e| fail(format!("create build log: {e}")))?;
        writeln!(log, "Building image {tag}").map_err(|e| fail(e.to_string()))?;

        // Terminal color codes emitted by build steps, not wanted in logs.
        let ansi_escape = Regex::new(r"\x1b\[[0-9;]*m").map_err(|e| fail(e.to_string()))?;

        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: "Dockerfile".to_string(),
            platform: platform.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| fail(format!("build stream: {e}")))?;
            if let Some(text) = info.stream {
                let clean = ansi_escape.replace_all(&text, "");
                log.write_all(clean.as_bytes())
                    .map_err(|e| fail(e.to_string()))?;
            }
            if let Some(error) = info.error {
                let detail = info
                    .error_detail
                    .and_then(|d| d.message)
                    .unwrap_or_default();
                let _ = writeln!(log, "{error}\n{detail}");
                return Err(fail(error));
            }
        }

        debug!(tag, "image build complete");
        Ok(())
    }

    /// Creates a container from an image. Returns the container ID.
    pub async fn create_container(
        &self,
        name: &str,
        image: &str,
        platform: &str,
        user: &str,
        nano_cpus: Option<i64>,
    ) -> Result<String, DockerError> {
        let host_config = HostConfig {
            nano_cpus,
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            // Keep the container alive so the harness can exec into it.
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            user: Some(user.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: Some(platform.to_string()),
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::CreateFailed(format!("{name}: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID or name.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Stops a container, allowing `grace_secs` before the engine kills it.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: grace_secs };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    /// Sends SIGKILL to a container's init process through the engine.
    pub async fn kill_container(&self, id: &str) -> Result<(), DockerError> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker.kill_container(id, Some(options)).await?;
        Ok(())
    }

    /// Force-removes a container and its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    /// Returns the PID of a container's init process, if it is running.
    pub async fn container_pid(&self, id: &str) -> Result<Option<i64>, DockerError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => DockerError::ContainerNotFound(id.to_string()),
                other => DockerError::Api(other),
            })?;
        Ok(inspect.state.and_then(|s| s.pid).filter(|pid| *pid > 0))
    }

    /// Copies a single file into a container directory.
    pub async fn copy_to_container(
        &self,
        id: &str,
        contents: &[u8],
        dest_dir: &str,
        filename: &str,
    ) -> Result<(), DockerError> {
        let archive = tar_file(contents, filename).map_err(|e| DockerError::CopyFailed {
            path: PathBuf::from(filename),
            reason: e.to_string(),
        })?;

        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| DockerError::CopyFailed {
                path: PathBuf::from(filename),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Executes a shell command inside a running container.
    pub async fn exec(&self, id: &str, cmd: &str) -> Result<ExecOutput, DockerError> {
        self.exec_with_timeout(id, cmd, None).await
    }

    /// Executes a shell command inside a running container, optionally cut
    /// off after `timeout`.
    ///
    /// On timeout the exec'd process is sent SIGTERM inside the container and
    /// the partial output captured so far is returned with `timed_out` set.
    /// Expiry is reported as a value, not an error, so callers can grade the
    /// partial output.
    pub async fn exec_with_timeout(
        &self,
        id: &str,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, DockerError> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["/bin/bash", "-c", cmd]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| DockerError::ExecFailed(format!("create exec: {e}")))?;

        let started = Instant::now();
        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DockerError::ExecFailed(format!("start exec: {e}")))?;

        let mut output = String::new();
        let mut timed_out = false;

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = start_result
        {
            let drain = async {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                        Err(e) => {
                            return Err(DockerError::ExecFailed(format!("read output: {e}")))
                        }
                    }
                }
                Ok(())
            };

            match timeout {
                Some(limit) => match tokio::time::timeout(limit, drain).await {
                    Ok(result) => result?,
                    Err(_) => timed_out = true,
                },
                None => drain.await?,
            }
        }

        let duration = started.elapsed();

        if timed_out {
            self.terminate_exec(id, &exec.id).await;
            return Ok(ExecOutput {
                output,
                exit_code: -1,
                timed_out: true,
                duration,
            });
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DockerError::ExecFailed(format!("inspect exec: {e}")))?;

        Ok(ExecOutput {
            output,
            exit_code: inspect.exit_code.unwrap_or(-1),
            timed_out: false,
            duration,
        })
    }

    /// Sends SIGTERM to an exec'd process that outlived its timeout. Failures
    /// are logged and swallowed; the container is torn down shortly after.
    async fn terminate_exec(&self, container_id: &str, exec_id: &str) {
        let pid = match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.pid,
            Err(e) => {
                warn!(container_id, "could not inspect timed-out exec: {e}");
                return;
            }
        };
        let Some(pid) = pid.filter(|p| *p > 0) else {
            return;
        };

        let kill = CreateExecOptions {
            cmd: Some(vec![
                "kill".to_string(),
                "-TERM".to_string(),
                pid.to_string(),
            ]),
            ..Default::default()
        };
        let result = async {
            let exec = self.docker.create_exec(container_id, kill).await?;
            self.docker.start_exec(&exec.id, None).await?;
            Ok::<_, bollard::errors::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(container_id, pid, "failed to signal timed-out process: {e}");
        }
    }

    /// Removes stopped harness containers matching a run id, used by the
    /// `clean-containers` command after an interrupted run.
    pub async fn list_harness_containers(
        &self,
        run_id: Option<&str>,
    ) -> Result<Vec<String>, DockerError> {
        let mut filters = HashMap::new();
        let pattern = match run_id {
            Some(run_id) => format!("^{IMAGE_PREFIX}.*\\.{run_id}$"),
            None => format!("^{IMAGE_PREFIX}"),
        };
        filters.insert("name".to_string(), vec![pattern]);

        let options = bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }
}

/// Tars an on-disk build context into memory.
fn tar_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

/// Wraps a single file's bytes in a tar archive for `PUT /archive`.
fn tar_file(contents: &[u8], filename: &str) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, filename, contents)?;
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_file_round_trip() {
        let archive = tar_file(b"diff --git a/x b/x\n", "patch.diff").unwrap();

        let mut entries = tar::Archive::new(archive.as_slice());
        let mut found = Vec::new();
        for entry in entries.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            std::io::Read::read_to_string(&mut entry, &mut body).unwrap();
            found.push((path, body));
        }

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "patch.diff");
        assert!(found[0].1.starts_with("diff --git"));
    }

    #[test]
    fn test_tar_directory_includes_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM ubuntu:22.04\n").unwrap();
        std::fs::write(dir.path().join("setup_env.sh"), "#!/bin/bash\n").unwrap();

        let archive = tar_directory(dir.path()).unwrap();
        let mut entries = tar::Archive::new(archive.as_slice());
        let paths: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(paths.iter().any(|p| p.ends_with("Dockerfile")));
        assert!(paths.iter().any(|p| p.ends_with("setup_env.sh")));
    }
}
