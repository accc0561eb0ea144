//! Per-instance execution: build, start, apply, test, grade, clean.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::build;
use crate::docker::{cleanup_container, start_instance_container, DockerClient};
use crate::error::{DockerError, EvaluationError};
use crate::grading::{
    get_eval_report, parser_for_repo, EvaluationReport, APPLY_PATCH_FAIL, PRED_PATCH_MARKER,
    TESTS_TIMEOUT,
};
use crate::run::logger::FileLogger;
use crate::run::RunPaths;
use crate::specs::{InstallSpec, Prediction, TestSpec};

/// Where an instance is in its lifecycle. Logged at every transition so an
/// interrupted run's logs show exactly how far each instance got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Started,
    PatchApplied,
    Tested,
    Graded,
    Cleaned,
    Errored,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Created => "created",
            InstanceState::Started => "started",
            InstanceState::PatchApplied => "patch_applied",
            InstanceState::Tested => "tested",
            InstanceState::Graded => "graded",
            InstanceState::Cleaned => "cleaned",
            InstanceState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Evaluates one instance end to end and returns its report.
///
/// An existing `report.json` short-circuits the whole run, making re-runs
/// idempotent. The container is torn down on every exit path, and a failure
/// here never propagates beyond this instance.
#[allow(clippy::too_many_arguments)]
pub async fn run_instance(
    client: &DockerClient,
    spec: &TestSpec,
    prediction: &Prediction,
    install: &InstallSpec,
    paths: &RunPaths,
    run_id: &str,
    timeout: Duration,
    force_rebuild: bool,
) -> Result<EvaluationReport, EvaluationError> {
    let model = prediction.model_dir_name();
    let dir = paths.instance_dir(&model, &spec.instance_id);
    let report_path = paths.report_path(&model, &spec.instance_id);
    let log_path = dir.join("run_instance.log");
    let eval_err = |message: String| {
        EvaluationError::new(&spec.instance_id, message, log_path.clone())
    };

    if report_path.exists() {
        let contents = std::fs::read_to_string(&report_path).map_err(|e| eval_err(e.to_string()))?;
        let report = serde_json::from_str(&contents)
            .map_err(|e| eval_err(format!("existing report is unreadable: {e}")))?;
        info!(instance_id = %spec.instance_id, "report exists, skipping");
        return Ok(report);
    }

    std::fs::create_dir_all(&dir).map_err(|e| eval_err(e.to_string()))?;
    let mut logger = FileLogger::create(&log_path).map_err(|e| eval_err(e.to_string()))?;

    build::build_instance_image(client, spec, force_rebuild, &paths.build_root())
        .await
        .map_err(|e| {
            logger.log(format!("state: {}", InstanceState::Errored));
            logger.log(e.to_string());
            eval_err(e.to_string())
        })?;

    let container = start_instance_container(client, spec, install, run_id)
        .await
        .map_err(|e| {
            logger.log(format!("state: {}", InstanceState::Errored));
            eval_err(format!("failed to start container: {e}"))
        })?;
    logger.log(format!(
        "state: {} (container {container})",
        InstanceState::Started
    ));

    let result = evaluate(
        client, spec, prediction, &container, &dir, &report_path, &mut logger, timeout,
    )
    .await
    .map_err(|message| {
        logger.log(format!("state: {}", InstanceState::Errored));
        logger.log(message.clone());
        eval_err(message)
    });

    cleanup_container(client, &container).await;
    logger.log(format!("state: {}", InstanceState::Cleaned));
    result
}

/// The fallible middle of the lifecycle, separated out so the caller can
/// guarantee container teardown around it. Errors are plain messages; the
/// caller attaches the instance context.
#[allow(clippy::too_many_arguments)]
async fn evaluate(
    client: &DockerClient,
    spec: &TestSpec,
    prediction: &Prediction,
    container: &str,
    dir: &Path,
    report_path: &Path,
    logger: &mut FileLogger,
    timeout: Duration,
) -> Result<EvaluationReport, String> {
    let patch = prediction.model_patch.as_deref().unwrap_or_default();
    std::fs::write(dir.join("patch.diff"), patch).map_err(|e| e.to_string())?;
    client
        .copy_to_container(container, patch.as_bytes(), "/tmp", "patch.diff")
        .await
        .map_err(|e| e.to_string())?;

    if !apply_patch(client, container, logger).await? {
        logger.log(format!("{APPLY_PATCH_FAIL} (pred)"));
        let report = EvaluationReport::negative(&spec.instance_id, true, false);
        write_report(report_path, &report)?;
        logger.log(format!("state: {}", InstanceState::Graded));
        return Ok(report);
    }
    logger.log(PRED_PATCH_MARKER);
    logger.log(format!("state: {}", InstanceState::PatchApplied));

    let diff_before = working_tree_diff(client, container).await?;

    client
        .copy_to_container(container, spec.eval_script.as_bytes(), "/root", "eval.sh")
        .await
        .map_err(|e| e.to_string())?;
    let run = client
        .exec_with_timeout(
            container,
            "chmod +x /root/eval.sh && /bin/bash /root/eval.sh",
            Some(timeout),
        )
        .await
        .map_err(|e| e.to_string())?;
    logger.log(format!(
        "state: {} (exit {}, {:.1}s)",
        InstanceState::Tested,
        run.exit_code,
        run.duration.as_secs_f64()
    ));

    let mut test_output = format!("{PRED_PATCH_MARKER}\n{}", run.output);
    if run.timed_out {
        test_output.push_str(&format!(
            "\n\n{TESTS_TIMEOUT} after {}s",
            timeout.as_secs()
        ));
    }
    std::fs::write(dir.join("test_output.txt"), &test_output).map_err(|e| e.to_string())?;

    if run.timed_out {
        return Err(format!("tests timed out after {}s", timeout.as_secs()));
    }

    let diff_after = working_tree_diff(client, container).await?;
    if diff_before != diff_after {
        warn!(
            instance_id = %spec.instance_id,
            "working tree changed during the test run"
        );
        logger.log("working tree diff changed during the test run");
    }

    let parser = parser_for_repo(&spec.repo).map_err(|e| e.to_string())?;
    let report = get_eval_report(spec, &test_output, parser, true);
    write_report(report_path, &report)?;
    logger.log(format!(
        "state: {} (resolved: {})",
        InstanceState::Graded,
        report.resolved
    ));
    Ok(report)
}

/// Applies the candidate patch, falling back from `git apply` to GNU patch
/// with fuzz. Returns whether either succeeded.
async fn apply_patch(
    client: &DockerClient,
    container: &str,
    logger: &mut FileLogger,
) -> Result<bool, String> {
    let git = exec_logged(
        client,
        container,
        "cd /testbed && git apply -v /tmp/patch.diff",
        logger,
    )
    .await?;
    if git == 0 {
        return Ok(true);
    }

    logger.log("git apply failed, retrying with patch --fuzz=5");
    let fallback = exec_logged(
        client,
        container,
        "cd /testbed && patch --batch --fuzz=5 -p1 -i /tmp/patch.diff",
        logger,
    )
    .await?;
    Ok(fallback == 0)
}

async fn exec_logged(
    client: &DockerClient,
    container: &str,
    cmd: &str,
    logger: &mut FileLogger,
) -> Result<i64, String> {
    let out = client
        .exec(container, cmd)
        .await
        .map_err(|e: DockerError| e.to_string())?;
    logger.log(format!("$ {cmd} (exit {})", out.exit_code));
    if !out.output.trim().is_empty() {
        logger.log(out.output.trim_end());
    }
    Ok(out.exit_code)
}

async fn working_tree_diff(client: &DockerClient, container: &str) -> Result<String, String> {
    let out = client
        .exec(container, "cd /testbed && git -c core.fileMode=false diff")
        .await
        .map_err(|e| e.to_string())?;
    Ok(out.output)
}

fn write_report(path: &Path, report: &EvaluationReport) -> Result<(), String> {
    let contents = serde_json::to_string_pretty(report).map_err(|e| e.to_string())?;
    std::fs::write(path, contents).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(InstanceState::PatchApplied.to_string(), "patch_applied");
        assert_eq!(InstanceState::Errored.to_string(), "errored");
    }

    #[test]
    fn test_failed_apply_report_shape() {
        let report = EvaluationReport::negative("astropy__astropy-1", true, false);
        assert!(report.patch_exists);
        assert!(!report.patch_is_empty);
        assert!(!report.patch_successfully_applied);
        assert!(!report.resolved);
        assert!(report.tests_status.is_none());
    }
}
