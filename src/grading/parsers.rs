//! Per-repo log parsers: raw test-framework output → uniform status map.
//!
//! Each supported test framework prints test outcomes in its own shape; the
//! registry maps a repo identifier to the parser that understands it. An
//! unknown repo is a [`ConfigurationError`], never a silent default.

use std::collections::HashMap;

use regex::Regex;

use crate::error::ConfigurationError;
use crate::grading::{TestStatus, TestStatusMap};

/// The log-parser variants for the supported test frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogParser {
    /// pytest with `-rA` summary lines (`PASSED path::test`).
    Pytest,
    /// pytest where parametrized ids carry bracketed options.
    PytestOptions,
    /// Django's `runtests.py --verbosity 2` output.
    Django,
    /// sympy's `bin/test` output.
    Sympy,
}

/// Resolves the parser for a repo identifier.
pub fn parser_for_repo(repo: &str) -> Result<LogParser, ConfigurationError> {
    match repo {
        "pallets/flask"
        | "psf/requests"
        | "pytest-dev/pytest"
        | "scikit-learn/scikit-learn" => Ok(LogParser::Pytest),
        "matplotlib/matplotlib" | "pydata/xarray" => Ok(LogParser::PytestOptions),
        "django/django" => Ok(LogParser::Django),
        "sympy/sympy" => Ok(LogParser::Sympy),
        other => Err(ConfigurationError::UnknownParser(other.to_string())),
    }
}

impl LogParser {
    /// Parses raw output into a test-id → status map.
    pub fn parse(&self, log: &str) -> TestStatusMap {
        match self {
            LogParser::Pytest => parse_pytest(log, false),
            LogParser::PytestOptions => parse_pytest(log, true),
            LogParser::Django => parse_django(log),
            LogParser::Sympy => parse_sympy(log),
        }
    }
}

fn status_token(token: &str) -> Option<TestStatus> {
    match token {
        "PASSED" => Some(TestStatus::Passed),
        "FAILED" => Some(TestStatus::Failed),
        "ERROR" => Some(TestStatus::Error),
        "SKIPPED" => Some(TestStatus::Skipped),
        "XFAIL" => Some(TestStatus::Xfail),
        _ => None,
    }
}

/// pytest `-rA` short summary: `STATUS test_id[ - reason]`. Some plugins
/// emit the reversed `test_id STATUS` form, which is accepted too.
fn parse_pytest(log: &str, keep_options: bool) -> TestStatusMap {
    let mut map = HashMap::new();
    for line in log.lines() {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let (Some(first), Some(second)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (status, raw_id) = if let Some(status) = status_token(first) {
            (status, second)
        } else if let Some(status) = status_token(second) {
            (status, first)
        } else {
            continue;
        };
        let id = if keep_options {
            raw_id.to_string()
        } else {
            // Drop a trailing parametrization suffix when the repo's
            // reference sets use bare ids.
            match raw_id.find('[') {
                Some(idx) if !raw_id.ends_with(']') => raw_id[..idx].to_string(),
                _ => raw_id.to_string(),
            }
        };
        map.insert(id, status);
    }
    map
}

/// Django verbosity-2 lines: `test_name (module.Class) ... ok|FAIL|ERROR|skipped`,
/// plus the `FAIL:`/`ERROR:` headers of the failure detail section.
fn parse_django(log: &str) -> TestStatusMap {
    let mut map = HashMap::new();
    let line_re = Regex::new(
        r"^(?P<test>\S+ \([^)]+\))\s*\.\.\.\s*(?P<outcome>ok|OK|FAIL|ERROR|skipped.*)$",
    )
    .expect("valid regex");
    let header_re =
        Regex::new(r"^(?P<kind>FAIL|ERROR): (?P<test>\S+ \([^)]+\))$").expect("valid regex");

    for line in log.lines() {
        let line = line.trim();
        if let Some(caps) = line_re.captures(line) {
            let test = caps["test"].to_string();
            let status = match &caps["outcome"] {
                "ok" | "OK" => TestStatus::Passed,
                "FAIL" => TestStatus::Failed,
                "ERROR" => TestStatus::Error,
                _ => TestStatus::Skipped,
            };
            map.insert(test, status);
        } else if let Some(caps) = header_re.captures(line) {
            let status = if &caps["kind"] == "FAIL" {
                TestStatus::Failed
            } else {
                TestStatus::Error
            };
            map.insert(caps["test"].to_string(), status);
        }
    }
    map
}

/// sympy `bin/test --verbose` lines: `test_name ok|E|F|f|s`.
fn parse_sympy(log: &str) -> TestStatusMap {
    let mut map = HashMap::new();
    let re = Regex::new(r"^(?P<test>test_\S+)\s+(?P<outcome>ok|E|F|f|s)$").expect("valid regex");
    for line in log.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            let status = match &caps["outcome"] {
                "ok" => TestStatus::Passed,
                "E" => TestStatus::Error,
                "F" | "f" => TestStatus::Failed,
                _ => TestStatus::Skipped,
            };
            map.insert(caps["test"].to_string(), status);
        }
    }
    map
}
