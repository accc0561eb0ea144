//! Task specs: from raw dataset records to fully rendered build/run recipes.
//!
//! A [`TaskInstance`] is what the dataset ships; a [`TestSpec`] is the
//! resolved recipe for one instance: deterministic image keys, the three
//! Dockerfile layers, and the shell scripts baked into them.

pub mod dockerfiles;
pub mod install;
pub mod scripts;
pub mod test_spec;

use serde::{Deserialize, Serialize};

pub use install::{InstallSpec, InstallSpecTable};
pub use test_spec::{make_test_spec, TestSpec};

/// Raw task instance record as shipped in the dataset split.
///
/// `fail_to_pass` / `pass_to_pass` are the reference test-id sets that define
/// what a correct fix must flip and must preserve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub instance_id: String,
    /// GitHub-style "owner/name" repo identifier.
    pub repo: String,
    /// Repo version used to key into the install table (e.g. "2.2").
    pub version: String,
    /// Commit the repo is checked out at before any patch is applied.
    pub base_commit: String,
    /// Reference (gold) patch. Not applied by the harness; kept for dataset parity.
    #[serde(default)]
    pub patch: String,
    /// Patch introducing/updating the tests the eval script runs.
    #[serde(default)]
    pub test_patch: String,
    #[serde(default, alias = "FAIL_TO_PASS")]
    pub fail_to_pass: Vec<String>,
    #[serde(default, alias = "PASS_TO_PASS")]
    pub pass_to_pass: Vec<String>,
}

/// One candidate patch for one instance, as read from a predictions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    #[serde(alias = "model")]
    pub model_name_or_path: String,
    /// The candidate diff. `None` or empty means the model produced no patch.
    #[serde(default)]
    pub model_patch: Option<String>,
}

impl Prediction {
    /// Whether this prediction carries an applicable patch at all.
    pub fn is_empty_patch(&self) -> bool {
        self.model_patch
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(true)
    }

    /// Model name with path separators flattened for use in directory names.
    pub fn model_dir_name(&self) -> String {
        self.model_name_or_path.replace('/', "__")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_empty_patch() {
        let mut pred = Prediction {
            instance_id: "a-1".to_string(),
            model_name_or_path: "org/model".to_string(),
            model_patch: None,
        };
        assert!(pred.is_empty_patch());

        pred.model_patch = Some("   \n".to_string());
        assert!(pred.is_empty_patch());

        pred.model_patch = Some("diff --git a/x b/x".to_string());
        assert!(!pred.is_empty_patch());
    }

    #[test]
    fn test_model_dir_name_flattens_slashes() {
        let pred = Prediction {
            instance_id: "a-1".to_string(),
            model_name_or_path: "org/model-v2".to_string(),
            model_patch: None,
        };
        assert_eq!(pred.model_dir_name(), "org__model-v2");
    }

    #[test]
    fn test_task_instance_deserializes_uppercase_aliases() {
        let raw = r#"{
            "instance_id": "pallets__flask-1",
            "repo": "pallets/flask",
            "version": "2.2",
            "base_commit": "abc123",
            "FAIL_TO_PASS": ["tests/test_a.py::test_x"],
            "PASS_TO_PASS": ["tests/test_a.py::test_y"]
        }"#;
        let inst: TaskInstance = serde_json::from_str(raw).unwrap();
        assert_eq!(inst.fail_to_pass.len(), 1);
        assert_eq!(inst.pass_to_pass.len(), 1);
        assert!(inst.test_patch.is_empty());
    }
}
