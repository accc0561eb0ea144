//! End-of-run aggregation.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigurationError;
use crate::grading::EvaluationReport;
use crate::run::RunPaths;
use crate::specs::{Prediction, TaskInstance};

/// Summary of one evaluation run, written as `<model>.<run_id>.json`.
///
/// Classification is derived from the on-disk reports, so the same function
/// produces a correct summary after a resumed or partially failed run:
/// - not submitted at all ⇒ incomplete
/// - submitted with an empty patch ⇒ empty_patch
/// - submitted with a report.json ⇒ completed, then resolved or unresolved
/// - submitted without a report.json ⇒ error
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub total_instances: usize,
    pub submitted_instances: usize,
    pub completed_instances: usize,
    pub resolved_instances: usize,
    pub unresolved_instances: usize,
    pub empty_patch_instances: usize,
    pub error_instances: usize,

    pub submitted_ids: Vec<String>,
    pub completed_ids: Vec<String>,
    pub incomplete_ids: Vec<String>,
    pub empty_patch_ids: Vec<String>,
    pub resolved_ids: Vec<String>,
    pub unresolved_ids: Vec<String>,
    pub error_ids: Vec<String>,
}

/// Builds the run report by walking the dataset against the submitted
/// predictions and the per-instance reports on disk.
pub fn make_run_report(
    dataset: &[TaskInstance],
    predictions: &HashMap<String, Prediction>,
    paths: &RunPaths,
) -> RunReport {
    let mut report = RunReport {
        total_instances: dataset.len(),
        submitted_instances: predictions.len(),
        ..Default::default()
    };
    report.submitted_ids = predictions.keys().cloned().collect();

    for instance in dataset {
        let id = &instance.instance_id;
        let Some(prediction) = predictions.get(id) else {
            report.incomplete_ids.push(id.clone());
            continue;
        };
        if prediction.is_empty_patch() {
            report.empty_patch_ids.push(id.clone());
            continue;
        }

        let report_path = paths.report_path(&prediction.model_dir_name(), id);
        let parsed: Option<EvaluationReport> = std::fs::read_to_string(&report_path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok());
        match parsed {
            Some(instance_report) => {
                report.completed_ids.push(id.clone());
                if instance_report.resolved {
                    report.resolved_ids.push(id.clone());
                } else {
                    report.unresolved_ids.push(id.clone());
                }
            }
            None => report.error_ids.push(id.clone()),
        }
    }

    report.submitted_ids.sort_unstable();
    report.completed_ids.sort_unstable();
    report.incomplete_ids.sort_unstable();
    report.empty_patch_ids.sort_unstable();
    report.resolved_ids.sort_unstable();
    report.unresolved_ids.sort_unstable();
    report.error_ids.sort_unstable();

    report.completed_instances = report.completed_ids.len();
    report.resolved_instances = report.resolved_ids.len();
    report.unresolved_instances = report.unresolved_ids.len();
    report.empty_patch_instances = report.empty_patch_ids.len();
    report.error_instances = report.error_ids.len();
    report
}

/// Writes the run report next to the working directory and logs the totals.
pub fn write_run_report(
    report: &RunReport,
    model: &str,
    run_id: &str,
) -> Result<PathBuf, ConfigurationError> {
    let path = PathBuf::from(format!("{model}.{run_id}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
    info!(
        total = report.total_instances,
        submitted = report.submitted_instances,
        completed = report.completed_instances,
        resolved = report.resolved_instances,
        unresolved = report.unresolved_instances,
        empty_patch = report.empty_patch_instances,
        error = report.error_instances,
        report = %path.display(),
        "run report written"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::predictions::gold_predictions;

    fn instance(id: &str) -> TaskInstance {
        TaskInstance {
            instance_id: id.to_string(),
            repo: "pallets/flask".to_string(),
            version: "2.0".to_string(),
            base_commit: "abc".to_string(),
            patch: "diff".to_string(),
            test_patch: String::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
        }
    }

    fn write_report(paths: &RunPaths, model: &str, id: &str, resolved: bool) {
        let path = paths.report_path(model, id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let report = EvaluationReport {
            instance_id: id.to_string(),
            patch_is_empty: false,
            patch_exists: true,
            patch_successfully_applied: true,
            resolved,
            tests_status: None,
        };
        std::fs::write(&path, serde_json::to_string(&report).unwrap()).unwrap();
    }

    #[test]
    fn test_run_report_classification() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());

        let dataset = vec![
            instance("done-resolved"),
            instance("done-unresolved"),
            instance("crashed"),
            instance("never-submitted"),
            instance("empty"),
        ];
        let mut predictions = gold_predictions(&dataset);
        predictions.remove("never-submitted");
        if let Some(p) = predictions.get_mut("empty") {
            p.model_patch = Some("  \n".to_string());
        }

        write_report(&paths, "gold", "done-resolved", true);
        write_report(&paths, "gold", "done-unresolved", false);

        let report = make_run_report(&dataset, &predictions, &paths);
        assert_eq!(report.total_instances, 5);
        assert_eq!(report.submitted_instances, 4);
        assert_eq!(report.completed_ids, vec!["done-resolved", "done-unresolved"]);
        assert_eq!(report.resolved_ids, vec!["done-resolved"]);
        assert_eq!(report.unresolved_ids, vec!["done-unresolved"]);
        assert_eq!(report.error_ids, vec!["crashed"]);
        assert_eq!(report.incomplete_ids, vec!["never-submitted"]);
        assert_eq!(report.empty_patch_ids, vec!["empty"]);
        assert_eq!(report.error_instances, 1);
        assert_eq!(report.resolved_instances, 1);
    }

    #[test]
    fn test_id_lists_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());

        let dataset = vec![instance("b-2"), instance("a-1"), instance("c-3")];
        let predictions = gold_predictions(&dataset);
        for id in ["b-2", "a-1", "c-3"] {
            write_report(&paths, "gold", id, false);
        }

        let report = make_run_report(&dataset, &predictions, &paths);
        assert_eq!(report.completed_ids, vec!["a-1", "b-2", "c-3"]);
        assert_eq!(report.submitted_ids, vec!["a-1", "b-2", "c-3"]);
    }
}
