//! sweval: patch evaluation harness.
//!
//! Rebuilds a target repository's environment inside Docker using a
//! three-tier image hierarchy, applies a candidate patch, runs the repo's
//! test suite, and grades the outcome against reference test sets.

pub mod build;
pub mod cli;
pub mod docker;
pub mod error;
pub mod grading;
pub mod run;
pub mod specs;

// Re-export commonly used error types
pub use error::{BuildImageError, ConfigurationError, DockerError, EvaluationError};
