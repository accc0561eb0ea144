//! Error types for the evaluation harness.
//!
//! Defines error types for the major subsystems:
//! - Spec construction from the install table
//! - Docker image builds
//! - Container lifecycle and command execution
//! - Per-instance evaluation

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving external configuration.
///
/// These always indicate a bad request (unknown repo/version, malformed
/// predictions file), never a transient fault, and abort the affected
/// instance rather than silently defaulting.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("No install spec for repo '{repo}' version '{version}'")]
    UnknownRepoVersion { repo: String, version: String },

    #[error("No log parser registered for repo '{0}'")]
    UnknownParser(String),

    #[error("Instance IDs not found in dataset: {0}")]
    MissingInstances(String),

    #[error("Prediction IDs not found in dataset: {0}")]
    UnknownPredictions(String),

    #[error("Invalid predictions file '{path}': {reason}")]
    InvalidPredictions { path: PathBuf, reason: String },

    #[error("Invalid run id '{0}': must be non-empty and contain only alphanumeric characters, hyphens, and underscores")]
    InvalidRunId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur talking to the Docker engine.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Failed to copy '{path}' into container: {reason}")]
    CopyFailed { path: PathBuf, reason: String },

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed image build. Carries the path of the streamed build log so the
/// failure can be diagnosed without rerunning the build.
#[derive(Debug, Error)]
#[error("Error building image {image}: {message}\nCheck ({}) for more information.", log_path.display())]
pub struct BuildImageError {
    pub image: String,
    pub message: String,
    pub log_path: PathBuf,
}

impl BuildImageError {
    pub fn new(image: impl Into<String>, message: impl Into<String>, log_path: PathBuf) -> Self {
        Self {
            image: image.into(),
            message: message.into(),
            log_path,
        }
    }
}

/// A failed evaluation of a single instance. Never propagated to sibling
/// instances; the orchestrator records it and moves on.
#[derive(Debug, Error)]
#[error("{instance_id}: {message}\nCheck ({}) for more information.", log_file.display())]
pub struct EvaluationError {
    pub instance_id: String,
    pub message: String,
    pub log_file: PathBuf,
}

impl EvaluationError {
    pub fn new(
        instance_id: impl Into<String>,
        message: impl Into<String>,
        log_file: PathBuf,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            message: message.into(),
            log_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_repo_version_message() {
        let err = ConfigurationError::UnknownRepoVersion {
            repo: "pallets/flask".to_string(),
            version: "9.9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pallets/flask"));
        assert!(msg.contains("9.9"));
    }

    #[test]
    fn test_build_image_error_carries_log_path() {
        let err = BuildImageError::new(
            "sweval.env.x86_64.abc:latest",
            "step 4 failed",
            PathBuf::from("/tmp/build_image.log"),
        );
        let msg = err.to_string();
        assert!(msg.contains("sweval.env.x86_64.abc:latest"));
        assert!(msg.contains("/tmp/build_image.log"));
    }

    #[test]
    fn test_evaluation_error_display() {
        let err = EvaluationError::new(
            "flask-1234",
            "patch apply failed",
            PathBuf::from("/logs/run_instance.log"),
        );
        assert!(err.to_string().starts_with("flask-1234:"));
    }
}
