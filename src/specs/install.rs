//! Install specification table.
//!
//! Maps (repo, version) to the recipe for setting up that repo's test
//! environment: runtime version, dependency installs, pre-install snippets,
//! the test invocation, and container execution flags. The table is loaded
//! once at startup and passed by reference into the spec builder and the
//! container manager; an unknown key is a [`ConfigurationError`], never a
//! silent default.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Default pytest invocation shared by most supported repos.
pub const TEST_PYTEST: &str = "pytest --no-header -rA --tb=no -p no:cacheprovider";

/// Environment-setup recipe for one (repo, version) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSpec {
    /// Python version to create the testbed environment with.
    pub python: String,
    /// Conda packages, or the literal "requirements.txt" / "environment.yml"
    /// to install from the repo's own pinned files.
    #[serde(default)]
    pub packages: Option<String>,
    /// Extra pip packages installed after the conda environment exists.
    #[serde(default)]
    pub pip_packages: Vec<String>,
    /// Shell snippets run inside the checkout before the install command.
    #[serde(default)]
    pub pre_install: Vec<String>,
    /// Command that installs the repo itself (editable install or setup.py).
    #[serde(default)]
    pub install: Option<String>,
    /// Test framework invocation; test directives are appended to this.
    pub test_cmd: String,
    /// Run the eval command as the unprivileged `nonroot` user.
    #[serde(default)]
    pub execute_test_as_nonroot: bool,
    /// CPU quota for the instance container, in units of 1e-9 CPUs.
    #[serde(default)]
    pub nano_cpus: Option<i64>,
}

impl InstallSpec {
    /// User the evaluation container runs as. The base image always creates
    /// the `nonroot` account, so the choice is purely per-spec.
    pub fn container_user(&self) -> &'static str {
        if self.execute_test_as_nonroot {
            "nonroot"
        } else {
            "root"
        }
    }
}

/// Immutable (repo, version) → [`InstallSpec`] lookup table.
///
/// Built from the embedded defaults, optionally extended/overridden from a
/// JSON file shaped `{ "<repo>": { "<version>": { ...spec... } } }`.
#[derive(Debug, Clone)]
pub struct InstallSpecTable {
    specs: HashMap<(String, String), InstallSpec>,
}

impl InstallSpecTable {
    /// The embedded defaults for the supported repos.
    pub fn builtin() -> Self {
        let mut specs = HashMap::new();

        let pytest_spec = |python: &str, install: &str| InstallSpec {
            python: python.to_string(),
            packages: Some("pytest".to_string()),
            pip_packages: Vec::new(),
            pre_install: Vec::new(),
            install: Some(install.to_string()),
            test_cmd: TEST_PYTEST.to_string(),
            execute_test_as_nonroot: false,
            nano_cpus: None,
        };

        for version in ["2.0", "2.1", "2.2", "2.3"] {
            specs.insert(
                ("pallets/flask".to_string(), version.to_string()),
                InstallSpec {
                    python: "3.11".to_string(),
                    packages: Some("requirements.txt".to_string()),
                    pip_packages: vec!["Werkzeug==2.2.2".to_string()],
                    install: Some("pip install -e .".to_string()),
                    ..pytest_spec("3.11", "pip install -e .")
                },
            );
        }

        for version in ["2.26", "2.27", "2.28", "2.31"] {
            specs.insert(
                ("psf/requests".to_string(), version.to_string()),
                pytest_spec("3.9", "pip install -e ."),
            );
        }

        for version in ["7.0", "7.1", "7.2", "7.4", "8.0"] {
            specs.insert(
                ("pytest-dev/pytest".to_string(), version.to_string()),
                InstallSpec {
                    test_cmd: "pytest -rA".to_string(),
                    ..pytest_spec("3.9", "pip install -e .")
                },
            );
        }

        for version in ["3.0", "3.1", "3.2", "4.0", "4.1", "4.2", "5.0"] {
            specs.insert(
                ("django/django".to_string(), version.to_string()),
                InstallSpec {
                    python: "3.11".to_string(),
                    packages: Some("requirements.txt".to_string()),
                    pip_packages: Vec::new(),
                    pre_install: Vec::new(),
                    install: Some("python -m pip install -e .".to_string()),
                    test_cmd: "./tests/runtests.py --verbosity 2".to_string(),
                    execute_test_as_nonroot: false,
                    nano_cpus: None,
                },
            );
        }

        for version in ["1.6", "1.7", "1.8", "1.9", "1.10", "1.11", "1.12", "1.13"] {
            specs.insert(
                ("sympy/sympy".to_string(), version.to_string()),
                InstallSpec {
                    python: "3.9".to_string(),
                    packages: Some("mpmath flake8".to_string()),
                    pip_packages: vec!["mpmath==1.3.0".to_string()],
                    pre_install: vec!["sed -i 's/theano/aesara/' sympy/external/importtools.py || true".to_string()],
                    install: Some("pip install -e .".to_string()),
                    test_cmd: "bin/test -C --verbose".to_string(),
                    execute_test_as_nonroot: false,
                    nano_cpus: None,
                },
            );
        }

        for version in ["1.0", "1.1", "1.2", "1.3", "1.4"] {
            specs.insert(
                ("scikit-learn/scikit-learn".to_string(), version.to_string()),
                InstallSpec {
                    python: "3.9".to_string(),
                    packages: Some(
                        "numpy scipy cython pytest pandas matplotlib joblib threadpoolctl"
                            .to_string(),
                    ),
                    pip_packages: Vec::new(),
                    pre_install: Vec::new(),
                    install: Some(
                        "pip install -v --no-use-pep517 --no-build-isolation -e .".to_string(),
                    ),
                    test_cmd: TEST_PYTEST.to_string(),
                    execute_test_as_nonroot: true,
                    nano_cpus: Some(2_000_000_000),
                },
            );
        }

        Self { specs }
    }

    /// Extends the builtin table with entries from a JSON override file.
    /// File entries win over builtin entries with the same key.
    pub fn with_overrides(path: &Path) -> Result<Self, ConfigurationError> {
        let mut table = Self::builtin();
        let content = std::fs::read_to_string(path)?;
        let overrides: HashMap<String, HashMap<String, InstallSpec>> =
            serde_json::from_str(&content)?;
        for (repo, versions) in overrides {
            for (version, spec) in versions {
                table.specs.insert((repo.clone(), version), spec);
            }
        }
        Ok(table)
    }

    /// Looks up the spec for (repo, version).
    pub fn get(&self, repo: &str, version: &str) -> Result<&InstallSpec, ConfigurationError> {
        self.specs
            .get(&(repo.to_string(), version.to_string()))
            .ok_or_else(|| ConfigurationError::UnknownRepoVersion {
                repo: repo.to_string(),
                version: version.to_string(),
            })
    }

    /// Number of (repo, version) entries.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_known_repo_version() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        assert_eq!(spec.python, "3.11");
        assert!(spec.test_cmd.contains("pytest"));
    }

    #[test]
    fn test_unknown_key_is_configuration_error() {
        let table = InstallSpecTable::builtin();
        let err = table.get("pallets/flask", "99.0").unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnknownRepoVersion { .. }
        ));

        let err = table.get("unknown/repo", "1.0").unwrap_err();
        assert!(err.to_string().contains("unknown/repo"));
    }

    #[test]
    fn test_nonroot_and_cpu_quota_flags() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("scikit-learn/scikit-learn", "1.3").unwrap();
        assert!(spec.execute_test_as_nonroot);
        assert_eq!(spec.container_user(), "nonroot");
        assert_eq!(spec.nano_cpus, Some(2_000_000_000));

        let spec = table.get("pallets/flask", "2.2").unwrap();
        assert_eq!(spec.container_user(), "root");
    }

    #[test]
    fn test_overrides_win_over_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pallets/flask": {{"2.2": {{"python": "3.12", "test_cmd": "pytest -q"}}}}}}"#
        )
        .unwrap();

        let table = InstallSpecTable::with_overrides(file.path()).unwrap();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        assert_eq!(spec.python, "3.12");
        assert_eq!(spec.test_cmd, "pytest -q");
        // Untouched keys survive the merge.
        assert!(table.get("psf/requests", "2.28").is_ok());
    }
}
