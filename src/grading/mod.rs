//! Grading engine: raw test output → status map → resolution verdict.
//!
//! Grading only ever reads the captured eval log. A patch counts as applied
//! when the log carries the apply-success marker and none of the fatal
//! markers; otherwise the report is negative without any parsing. A test id
//! absent from the status map counts as a failure for both the fail-to-pass
//! and pass-to-pass checks.

pub mod parsers;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::specs::TestSpec;

pub use parsers::{parser_for_repo, LogParser};

/// Markers written into the captured eval log. Grading keys off these.
pub const APPLY_PATCH_PASS: &str = ">>>>> Applied Patch";
pub const APPLY_PATCH_FAIL: &str = ">>>>> Patch Apply Failed";
pub const RESET_FAILED: &str = ">>>>> Reset Failed";
pub const TESTS_ERROR: &str = ">>>>> Tests Errored";
pub const TESTS_TIMEOUT: &str = ">>>>> Tests Timed Out";

/// Marker line prepended to the eval log once the candidate patch applied.
pub const PRED_PATCH_MARKER: &str = ">>>>> Applied Patch (pred)";

/// Uniform per-test outcome across all supported frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    /// Expected failure; counted as a pass, matching the source frameworks.
    Xfail,
}

/// test-id → outcome, as produced by a [`LogParser`].
pub type TestStatusMap = HashMap<String, TestStatus>;

/// How well the evaluated patch matched the reference test-outcome delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolvedStatus {
    Full,
    Partial,
    No,
}

/// Per-direction success/failure id lists for the detailed report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestOutcomes {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

/// Detailed per-test grading breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TestOutcomes,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TestOutcomes,
}

/// Final per-instance evaluation report, persisted as `report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub instance_id: String,
    pub patch_is_empty: bool,
    pub patch_exists: bool,
    pub patch_successfully_applied: bool,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_status: Option<TestsStatus>,
}

impl EvaluationReport {
    /// Negative report used whenever grading never ran.
    pub fn negative(instance_id: &str, patch_exists: bool, patch_is_empty: bool) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            patch_is_empty,
            patch_exists,
            patch_successfully_applied: false,
            resolved: false,
            tests_status: None,
        }
    }
}

/// Whether the map records this test as passing. Skips do not count.
fn test_passed(case: &str, map: &TestStatusMap) -> bool {
    matches!(
        map.get(case),
        Some(TestStatus::Passed) | Some(TestStatus::Xfail)
    )
}

/// Extracts the status map from a captured eval log.
///
/// Returns `(map, true)` only when the candidate patch demonstrably applied
/// and the run reached the test stage; any fatal marker, or a missing apply
/// marker, yields `(empty, false)`. Parsing starts after the last candidate
/// apply marker so setup noise never leaks test ids into the map.
pub fn get_logs_eval(content: &str, parser: LogParser) -> (TestStatusMap, bool) {
    let fatal = [APPLY_PATCH_FAIL, RESET_FAILED, TESTS_ERROR, TESTS_TIMEOUT];
    if fatal.iter().any(|m| content.contains(m)) || !content.contains(APPLY_PATCH_PASS) {
        return (TestStatusMap::new(), false);
    }
    let tail = content
        .rsplit_once(PRED_PATCH_MARKER)
        .map(|(_, tail)| tail)
        .unwrap_or(content);
    (parser.parse(tail), true)
}

/// Splits the reference sets into success/failure lists against the map.
/// An id missing from the map is a failure, never a silent success.
pub fn get_eval_tests_report(map: &TestStatusMap, spec: &TestSpec) -> TestsStatus {
    let split = |cases: &[String]| {
        let mut outcomes = TestOutcomes::default();
        for case in cases {
            if test_passed(case, map) {
                outcomes.success.push(case.clone());
            } else {
                outcomes.failure.push(case.clone());
            }
        }
        outcomes
    };
    TestsStatus {
        fail_to_pass: split(&spec.fail_to_pass),
        pass_to_pass: split(&spec.pass_to_pass),
    }
}

fn rate(outcomes: &TestOutcomes) -> f64 {
    let total = outcomes.success.len() + outcomes.failure.len();
    if total == 0 {
        return 1.0;
    }
    outcomes.success.len() as f64 / total as f64
}

/// Fraction of FAIL_TO_PASS tests now passing; 1.0 for an empty set.
pub fn compute_fail_to_pass(status: &TestsStatus) -> f64 {
    rate(&status.fail_to_pass)
}

/// Fraction of PASS_TO_PASS tests still passing; 1.0 for an empty set.
pub fn compute_pass_to_pass(status: &TestsStatus) -> f64 {
    rate(&status.pass_to_pass)
}

/// FULL iff both rates are 1; PARTIAL iff some but not all target tests
/// flipped and nothing regressed; NO otherwise. Any regression among
/// previously-passing tests forecloses both FULL and PARTIAL.
pub fn get_resolution_status(status: &TestsStatus) -> ResolvedStatus {
    let f2p = compute_fail_to_pass(status);
    let p2p = compute_pass_to_pass(status);
    if f2p == 1.0 && p2p == 1.0 {
        ResolvedStatus::Full
    } else if f2p > 0.0 && f2p < 1.0 && p2p == 1.0 {
        ResolvedStatus::Partial
    } else {
        ResolvedStatus::No
    }
}

/// Builds the full per-instance report from the captured eval log.
pub fn get_eval_report(
    spec: &TestSpec,
    log_content: &str,
    parser: LogParser,
    include_tests_status: bool,
) -> EvaluationReport {
    let mut report = EvaluationReport::negative(&spec.instance_id, true, false);

    let (map, applied) = get_logs_eval(log_content, parser);
    if !applied {
        return report;
    }
    report.patch_successfully_applied = true;

    let status = get_eval_tests_report(&map, spec);
    report.resolved = get_resolution_status(&status) == ResolvedStatus::Full;
    if include_tests_status {
        report.tests_status = Some(status);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::install::InstallSpecTable;
    use crate::specs::{make_test_spec, TaskInstance};

    fn spec_with(f2p: &[&str], p2p: &[&str]) -> TestSpec {
        let instance = TaskInstance {
            instance_id: "pallets__flask-1".to_string(),
            repo: "pallets/flask".to_string(),
            version: "2.2".to_string(),
            base_commit: "deadbeef".to_string(),
            patch: String::new(),
            test_patch: String::new(),
            fail_to_pass: f2p.iter().map(|s| s.to_string()).collect(),
            pass_to_pass: p2p.iter().map(|s| s.to_string()).collect(),
        };
        make_test_spec(&instance, &InstallSpecTable::builtin()).unwrap()
    }

    fn log_with(lines: &[&str]) -> String {
        format!("{PRED_PATCH_MARKER}\n{}\n", lines.join("\n"))
    }

    #[test]
    fn test_full_resolution_when_everything_passes() {
        let spec = spec_with(&["t1", "t2"], &["t3"]);
        let log = log_with(&["PASSED t1", "PASSED t2", "PASSED t3"]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, true);
        assert!(report.patch_successfully_applied);
        assert!(report.resolved);
        let status = report.tests_status.unwrap();
        assert_eq!(status.fail_to_pass.success.len(), 2);
        assert!(status.pass_to_pass.failure.is_empty());
    }

    #[test]
    fn test_partial_when_one_target_missing() {
        let spec = spec_with(&["t1", "t2"], &["t3"]);
        let log = log_with(&["PASSED t1", "PASSED t3"]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, true);
        let status = report.tests_status.unwrap();
        assert_eq!(get_resolution_status(&status), ResolvedStatus::Partial);
        assert!(!report.resolved);
        // The missing id is reported as a failure, not silently dropped.
        assert_eq!(status.fail_to_pass.failure, vec!["t2".to_string()]);
    }

    #[test]
    fn test_regression_forecloses_full_and_partial() {
        let spec = spec_with(&["t1"], &["t2", "t3"]);
        let log = log_with(&["PASSED t1", "PASSED t2", "FAILED t3 - boom"]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, true);
        let status = report.tests_status.unwrap();
        assert_eq!(get_resolution_status(&status), ResolvedStatus::No);
    }

    #[test]
    fn test_vacuous_sets_resolve_full() {
        let spec = spec_with(&[], &[]);
        let log = log_with(&[]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, false);
        assert!(report.resolved);
    }

    #[test]
    fn test_skipped_counts_as_failure_for_both_directions() {
        let spec = spec_with(&["t1"], &["t2"]);
        let log = log_with(&["SKIPPED t1", "SKIPPED t2"]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, true);
        let status = report.tests_status.unwrap();
        assert_eq!(status.fail_to_pass.failure, vec!["t1".to_string()]);
        assert_eq!(status.pass_to_pass.failure, vec!["t2".to_string()]);
        assert_eq!(get_resolution_status(&status), ResolvedStatus::No);
    }

    #[test]
    fn test_xfail_counts_as_pass() {
        let spec = spec_with(&["t1"], &[]);
        let log = log_with(&["XFAIL t1"]);
        let report = get_eval_report(&spec, &log, LogParser::Pytest, false);
        assert!(report.resolved);
    }

    #[test]
    fn test_missing_apply_marker_blocks_grading() {
        let spec = spec_with(&["t1"], &[]);
        let log = "PASSED t1\n".to_string();
        let report = get_eval_report(&spec, &log, LogParser::Pytest, true);
        assert!(!report.patch_successfully_applied);
        assert!(!report.resolved);
        assert!(report.tests_status.is_none());
    }

    #[test]
    fn test_fatal_markers_block_grading() {
        for marker in [APPLY_PATCH_FAIL, TESTS_ERROR, TESTS_TIMEOUT, RESET_FAILED] {
            let log = format!("{PRED_PATCH_MARKER}\nPASSED t1\n{marker}\n");
            let (_, applied) = get_logs_eval(&log, LogParser::Pytest);
            assert!(!applied, "marker {marker} must block grading");
        }
    }

    #[test]
    fn test_parsing_starts_after_last_pred_marker() {
        let spec = spec_with(&["t1"], &[]);
        // Noise before the marker must not leak into the status map.
        let log = format!("FAILED t1 - setup noise\n{PRED_PATCH_MARKER}\nPASSED t1\n");
        let report = get_eval_report(&spec, &log, LogParser::Pytest, false);
        assert!(report.resolved);
    }

    #[test]
    fn test_rates_empty_sets_are_one() {
        let status = TestsStatus::default();
        assert_eq!(compute_fail_to_pass(&status), 1.0);
        assert_eq!(compute_pass_to_pass(&status), 1.0);
    }

    #[test]
    fn test_report_serialization_shape() {
        let report = EvaluationReport::negative("x-1", false, true);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"patch_is_empty\":true"));
        assert!(json.contains("\"resolved\":false"));
        assert!(!json.contains("tests_status"));
    }
}
