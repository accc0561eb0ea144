//! Shell script rendering for the env and instance image tiers, plus the
//! per-instance eval script.
//!
//! The rendered text is baked into the image build context verbatim, so the
//! env image key can hash `setup_env.sh` to detect install-config changes.

use crate::specs::install::InstallSpec;
use crate::specs::TaskInstance;

/// Heredoc delimiter for inlining the test patch into eval.sh. Chosen to
/// never collide with patch content.
const HEREDOC_DELIMITER: &str = "EOF_114329324912";

/// File extensions that never identify a runnable test file.
const NON_TEST_EXTS: &[&str] = &[
    ".json", ".png", ".csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

/// Extracts the test files touched by a test patch, in diff order.
///
/// Django test paths are rewritten into test-runner labels
/// (`tests/foo/test_bar.py` → `foo.test_bar`).
pub fn get_test_directives(repo: &str, test_patch: &str) -> Vec<String> {
    let mut directives = Vec::new();
    for line in test_patch.lines() {
        let Some(rest) = line.strip_prefix("diff --git a/") else {
            continue;
        };
        let Some(path) = rest.split(" b/").nth(1) else {
            continue;
        };
        if NON_TEST_EXTS.iter().any(|ext| path.ends_with(ext)) {
            continue;
        }
        let directive = if repo == "django/django" {
            path.trim_start_matches("tests/")
                .trim_end_matches(".py")
                .replace('/', ".")
        } else {
            path.to_string()
        };
        if !directives.contains(&directive) {
            directives.push(directive);
        }
    }
    directives
}

/// Renders `setup_env.sh`: creates the pinned conda environment for the
/// (repo, version) pair. Shared by every instance of that pair.
pub fn make_setup_env_script(spec: &InstallSpec) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -euxo pipefail".to_string(),
        "source /opt/miniconda3/bin/activate".to_string(),
    ];

    match spec.packages.as_deref() {
        // File-based dependency sets need a checkout and are installed in
        // setup_repo.sh instead; here we only pin the interpreter.
        Some("requirements.txt") | Some("environment.yml") | None => {
            lines.push(format!("conda create -n testbed python={} -y", spec.python));
        }
        Some(packages) => {
            lines.push(format!(
                "conda create -n testbed python={} {} -y",
                spec.python, packages
            ));
        }
    }
    lines.push("conda activate testbed".to_string());

    if !spec.pip_packages.is_empty() {
        lines.push(format!(
            "python -m pip install {}",
            spec.pip_packages.join(" ")
        ));
    }

    lines.push("echo \"Environment setup complete\"".to_string());
    lines.join("\n") + "\n"
}

/// Renders `setup_repo.sh`: checks out the repo at the instance's base
/// commit and runs pre-install plus install steps. Unique per instance.
pub fn make_install_repo_script(instance: &TaskInstance, spec: &InstallSpec) -> String {
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -euxo pipefail".to_string(),
        format!(
            "git clone -o origin https://github.com/{} /testbed",
            instance.repo
        ),
        "chmod -R 777 /testbed".to_string(),
        "cd /testbed".to_string(),
        format!("git reset --hard {}", instance.base_commit),
        "git remote remove origin".to_string(),
        "source /opt/miniconda3/bin/activate".to_string(),
        "conda activate testbed".to_string(),
        "echo \"Current environment: $CONDA_DEFAULT_ENV\"".to_string(),
    ];

    match spec.packages.as_deref() {
        Some("requirements.txt") => {
            lines.push("python -m pip install -r requirements.txt".to_string());
        }
        Some("environment.yml") => {
            lines.push("conda env update -n testbed -f environment.yml".to_string());
        }
        _ => {}
    }
    for snippet in &spec.pre_install {
        lines.push(snippet.clone());
    }
    if let Some(install) = &spec.install {
        lines.push(install.clone());
    }

    lines.join("\n") + "\n"
}

/// Renders `eval.sh`: restores tracked test files, applies the test patch
/// (with apply markers the grader keys off), runs the test command against
/// the test directives, then restores the test files again.
pub fn make_eval_script(instance: &TaskInstance, spec: &InstallSpec) -> String {
    let directives = get_test_directives(&instance.repo, &instance.test_patch);
    let directive_args = directives.join(" ");

    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -uxo pipefail".to_string(),
        "source /opt/miniconda3/bin/activate".to_string(),
        "conda activate testbed".to_string(),
        "cd /testbed".to_string(),
        "git config --global --add safe.directory /testbed".to_string(),
        "git status".to_string(),
        format!("git -c core.fileMode=false diff {}", instance.base_commit),
    ];

    if !directives.is_empty() {
        lines.push(format!(
            "git checkout {} -- {}",
            instance.base_commit, directive_args
        ));
    }

    if !instance.test_patch.trim().is_empty() {
        lines.push(format!(
            "if git apply -v - <<'{delim}'\n{patch}\n{delim}",
            delim = HEREDOC_DELIMITER,
            patch = instance.test_patch.trim_end(),
        ));
        lines.push("then".to_string());
        lines.push(format!("    echo '{} (test)'", crate::grading::APPLY_PATCH_PASS));
        lines.push("else".to_string());
        lines.push(format!("    echo '{} (test)'", crate::grading::APPLY_PATCH_FAIL));
        lines.push("    exit 1".to_string());
        lines.push("fi".to_string());
    }

    lines.push(format!("{} {}", spec.test_cmd, directive_args).trim_end().to_string());

    if !directives.is_empty() {
        lines.push(format!(
            "git checkout {} -- {}",
            instance.base_commit, directive_args
        ));
    }

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::install::InstallSpecTable;

    fn instance(repo: &str, test_patch: &str) -> TaskInstance {
        TaskInstance {
            instance_id: "test__inst-1".to_string(),
            repo: repo.to_string(),
            version: "2.2".to_string(),
            base_commit: "deadbeef".to_string(),
            patch: String::new(),
            test_patch: test_patch.to_string(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
        }
    }

    const PATCH: &str = "diff --git a/tests/test_app.py b/tests/test_app.py\n\
--- a/tests/test_app.py\n\
+++ b/tests/test_app.py\n\
@@ -1 +1,2 @@\n\
 pass\n\
+pass\n\
diff --git a/docs/notes.md b/docs/notes.md\n\
--- a/docs/notes.md\n\
+++ b/docs/notes.md\n";

    #[test]
    fn test_directives_filter_non_test_extensions() {
        let dirs = get_test_directives("pallets/flask", PATCH);
        assert_eq!(dirs, vec!["tests/test_app.py"]);
    }

    #[test]
    fn test_directives_django_labels() {
        let patch = "diff --git a/tests/auth_tests/test_views.py b/tests/auth_tests/test_views.py\n";
        let dirs = get_test_directives("django/django", patch);
        assert_eq!(dirs, vec!["auth_tests.test_views"]);
    }

    #[test]
    fn test_directives_dedupe() {
        let patch = "diff --git a/tests/a.py b/tests/a.py\ndiff --git a/tests/a.py b/tests/a.py\n";
        let dirs = get_test_directives("pallets/flask", patch);
        assert_eq!(dirs.len(), 1);
    }

    #[test]
    fn test_setup_env_script_conda_packages() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("scikit-learn/scikit-learn", "1.3").unwrap();
        let script = make_setup_env_script(spec);
        assert!(script.contains("conda create -n testbed python=3.9 numpy scipy"));
        assert!(script.starts_with("#!/bin/bash"));
    }

    #[test]
    fn test_setup_env_script_defers_requirements_file() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        let script = make_setup_env_script(spec);
        // Interpreter only; requirements install happens after checkout.
        assert!(script.contains("conda create -n testbed python=3.11 -y"));
        assert!(!script.contains("-r requirements.txt"));
        assert!(script.contains("pip install Werkzeug==2.2.2"));
    }

    #[test]
    fn test_install_repo_script_checks_out_base_commit() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        let script = make_install_repo_script(&instance("pallets/flask", ""), spec);
        assert!(script.contains("git clone -o origin https://github.com/pallets/flask /testbed"));
        assert!(script.contains("git reset --hard deadbeef"));
        assert!(script.contains("python -m pip install -r requirements.txt"));
        assert!(script.contains("pip install -e ."));
    }

    #[test]
    fn test_eval_script_applies_test_patch_with_markers() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        let script = make_eval_script(&instance("pallets/flask", PATCH), spec);
        assert!(script.contains(">>>>> Applied Patch (test)"));
        assert!(script.contains(">>>>> Patch Apply Failed (test)"));
        assert!(script.contains("git checkout deadbeef -- tests/test_app.py"));
        assert!(script.contains("pytest --no-header -rA --tb=no -p no:cacheprovider tests/test_app.py"));
    }

    #[test]
    fn test_eval_script_without_test_patch_skips_apply() {
        let table = InstallSpecTable::builtin();
        let spec = table.get("pallets/flask", "2.2").unwrap();
        let script = make_eval_script(&instance("pallets/flask", ""), spec);
        assert!(!script.contains("git apply"));
        assert!(script.contains(spec.test_cmd.as_str()));
    }
}
