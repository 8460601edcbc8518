//! Python ecosystem strategy.
//!
//! Probe scripts run under `coverage run`; characterization tests run under
//! pytest with pytest-cov; the build gate is `python -m compileall`.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use super::exec::{run_command, ExecOutcome};
use super::{
    build_file_sections, guidance_mocks, guidance_notes, guidance_side_effects,
    strip_code_fences, synthetic_errored, tree_has_extension, ParsedTestOutput, TargetStrategy,
    SYSTEM_GOLDEN_SCRIPT, SYSTEM_TEST_GENERATION,
};
use crate::generator::TextGenerator;
use crate::model::{TestGuidance, TestItemResult, TestItemStatus, TestRunResult};

const GOLDEN_SCRIPT_PROMPT: &str = "\
Generate a standalone Python script that:
1. Imports all public functions/classes from the source files
2. Calls each public function with representative arguments
3. Prints ALL return values as a single JSON object to stdout

Source files in this module:
{file_sections}

Dependent source files (signatures of imported modules):
{dependency_info}
Use this context to understand the types, classes and functions available.

Testing guidance:
- Side effects: {side_effects}
- Mock recommendations: {mock_recommendations}
- Nondeterminism notes: {nondeterminism_notes}

Requirements:
- IMPORTANT: The file's parent directory is NOT a Python package (no __init__.py).
  You MUST add the file's directory to sys.path before importing.
- The script must be self-contained and runnable with `python script.py`
- Use `from unittest.mock import patch` if mocking is needed
- For class methods, instantiate the class first
- Use DESCRIPTIVE keys in the results dict so we know what was tested.
  Format: \"ClassName_methodName_scenario\" or \"functionName_scenario\".
  Do NOT use generic keys like \"result1\", \"test1\", \"output\".
- Collect all results into a dict and print as JSON on the LAST line
- The LAST line must be: print(json.dumps(results, default=str))
- Do NOT include markdown code fences, return raw Python code only
- Do NOT print anything else to stdout
";

const CHARACTERIZATION_TEST_PROMPT: &str = "\
Generate a complete pytest test file that verifies the refactored code
produces the same outputs as the original code.

New source files (after refactoring):
{file_sections}

Dependent source files (signatures):
{dependency_info}

Testing guidance:
- Side effects: {side_effects}
- Mock recommendations: {mock_recommendations}
- Nondeterminism notes: {nondeterminism_notes}

Golden output (expected behavior from the original code):
{golden_output}

Requirements:
1. For each golden output key, find the corresponding function/class in the
   new code and assert it produces the same value
2. IMPORTANT: Add the source directory to sys.path before importing
3. Use pytest assertions (assert actual == expected)
4. Mock any side effects (file I/O, network, DB) as indicated in guidance
5. If a golden key has no corresponding function in the new code, skip it
   with a comment explaining why
6. Do NOT include markdown code fences, return raw Python code only
7. The test file must be self-contained and runnable with `pytest test_file.py`
";

#[derive(Debug, Default)]
pub struct PythonStrategy;

impl PythonStrategy {
    pub fn new() -> Self {
        Self
    }

    /// PYTHONPATH pointing at the tree root plus each configured source dir.
    fn python_env(work_dir: &Path, source_dirs: &[String]) -> HashMap<String, String> {
        let mut parts: Vec<String> = source_dirs
            .iter()
            .map(|d| work_dir.join(d).display().to_string())
            .collect();
        parts.push(work_dir.display().to_string());
        if let Ok(existing) = std::env::var("PYTHONPATH") {
            if !existing.is_empty() {
                parts.push(existing);
            }
        }
        let mut env = HashMap::new();
        env.insert("PYTHONPATH".to_string(), parts.join(":"));
        env
    }

    fn outcome_to_result(outcome: ExecOutcome, coverage_pct: Option<f64>) -> TestRunResult {
        TestRunResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            coverage_pct,
        }
    }

    /// Read a percentage out of `coverage report` output ("TOTAL ... 87%").
    fn read_coverage_data(cov_data: &Path, work_dir: &Path) -> Option<f64> {
        if !cov_data.exists() {
            return None;
        }
        let data_file = format!("--data-file={}", cov_data.display());
        let outcome = run_command(
            "coverage",
            &["report", &data_file],
            work_dir,
            &HashMap::new(),
            Duration::from_secs(10),
        );
        parse_total_percent(&outcome.stdout)
    }

    fn parse_pytest_coverage(work_dir: &Path, stdout: &str) -> Option<f64> {
        let cov_json = work_dir.join("coverage.json");
        if let Ok(text) = std::fs::read_to_string(&cov_json) {
            if let Ok(data) = serde_json::from_str::<serde_json::Value>(&text) {
                if let Some(pct) = data["totals"]["percent_covered"].as_f64() {
                    return Some((pct * 100.0).round() / 100.0);
                }
            }
        }
        static TOTAL_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"TOTAL\s+\d+\s+\d+\s+(\d+)%").unwrap());
        TOTAL_RE
            .captures(stdout)
            .and_then(|c| c[1].parse::<f64>().ok())
    }
}

fn parse_total_percent(stdout: &str) -> Option<f64> {
    for line in stdout.lines().rev() {
        if line.contains("TOTAL") {
            for part in line.split_whitespace().rev() {
                if let Some(num) = part.strip_suffix('%') {
                    return num.parse::<f64>().ok();
                }
            }
        }
    }
    None
}

#[async_trait]
impl TargetStrategy for PythonStrategy {
    fn id(&self) -> &'static str {
        "python"
    }

    fn source_extension(&self) -> &'static str {
        ".py"
    }

    fn test_file_name(&self, stem: &str) -> String {
        format!("test_{stem}.py")
    }

    async fn generate_probe_script(
        &self,
        source_code: &str,
        module_paths: &[String],
        dep_signatures: &str,
        guidance: Option<&TestGuidance>,
        generator: &dyn TextGenerator,
    ) -> anyhow::Result<String> {
        let prompt = GOLDEN_SCRIPT_PROMPT
            .replace(
                "{file_sections}",
                &build_file_sections(source_code, module_paths, "python"),
            )
            .replace(
                "{dependency_info}",
                if dep_signatures.is_empty() {
                    "No internal dependencies."
                } else {
                    dep_signatures
                },
            )
            .replace("{side_effects}", &guidance_side_effects(guidance))
            .replace("{mock_recommendations}", &guidance_mocks(guidance))
            .replace("{nondeterminism_notes}", &guidance_notes(guidance));

        let response = generator.generate(&prompt, Some(SYSTEM_GOLDEN_SCRIPT)).await?;
        Ok(strip_code_fences(&response))
    }

    fn run_with_coverage(
        &self,
        script_path: &Path,
        work_dir: &Path,
        source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult {
        let cov_data = script_path.with_extension("coverage");
        let data_file = format!("--data-file={}", cov_data.display());
        let script = script_path.display().to_string();
        let env = Self::python_env(work_dir, source_dirs);

        let outcome = run_command(
            "coverage",
            &["run", &data_file, &script],
            work_dir,
            &env,
            timeout,
        );
        if outcome.timed_out {
            return Self::outcome_to_result(outcome, None);
        }
        let coverage = Self::read_coverage_data(&cov_data, work_dir);
        Self::outcome_to_result(outcome, coverage)
    }

    async fn generate_test_file(
        &self,
        new_source_code: &str,
        module_paths: &[String],
        golden_values: &serde_json::Map<String, serde_json::Value>,
        dep_signatures: &str,
        guidance: Option<&TestGuidance>,
        generator: &dyn TextGenerator,
    ) -> anyhow::Result<String> {
        let golden_str = serde_json::to_string_pretty(golden_values)?;
        let prompt = CHARACTERIZATION_TEST_PROMPT
            .replace(
                "{file_sections}",
                &build_file_sections(new_source_code, module_paths, "python"),
            )
            .replace(
                "{dependency_info}",
                if dep_signatures.is_empty() {
                    "No internal dependencies."
                } else {
                    dep_signatures
                },
            )
            .replace("{side_effects}", &guidance_side_effects(guidance))
            .replace("{mock_recommendations}", &guidance_mocks(guidance))
            .replace("{nondeterminism_notes}", &guidance_notes(guidance))
            .replace("{golden_output}", &golden_str);

        let response = generator
            .generate(&prompt, Some(SYSTEM_TEST_GENERATION))
            .await?;
        Ok(strip_code_fences(&response))
    }

    fn run_tests(
        &self,
        test_file_path: &Path,
        work_dir: &Path,
        source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult {
        let test_file = test_file_path.display().to_string();
        let rootdir = format!("--rootdir={}", work_dir.display());
        let cov = format!("--cov={}", work_dir.display());
        let env = Self::python_env(work_dir, source_dirs);

        let outcome = run_command(
            "python",
            &[
                "-m",
                "pytest",
                &test_file,
                "-v",
                "--tb=short",
                "--no-header",
                &rootdir,
                "-o",
                "addopts=",
                &cov,
                "--cov-report=json",
            ],
            work_dir,
            &env,
            timeout,
        );
        if outcome.timed_out {
            return Self::outcome_to_result(outcome, None);
        }
        let coverage = Self::parse_pytest_coverage(work_dir, &outcome.stdout);
        Self::outcome_to_result(outcome, coverage)
    }

    fn check_build(&self, repo_dir: &Path, timeout: Duration) -> (bool, String) {
        if !tree_has_extension(repo_dir, "py") {
            return (true, "No python files found".to_string());
        }
        let dir = repo_dir.display().to_string();
        let outcome = run_command(
            "python",
            &["-m", "compileall", "-q", &dir],
            repo_dir,
            &HashMap::new(),
            timeout,
        );
        if outcome.timed_out {
            return (false, outcome.stderr);
        }
        (
            outcome.exit_code == 0,
            format!("{}{}", outcome.stdout, outcome.stderr),
        )
    }

    fn parse_test_output(&self, stdout: &str, stderr: &str, exit_code: i32) -> ParsedTestOutput {
        let reasons = parse_failure_reasons(stdout);
        let items = parse_verbose_items(stdout, &reasons);
        let (passed, failed, errored) = parse_summary_counts(stdout);

        if passed == 0 && failed == 0 && errored == 0 && items.is_empty() && exit_code != 0 {
            return synthetic_errored(if stderr.trim().is_empty() { stdout } else { stderr });
        }

        ParsedTestOutput {
            passed,
            failed,
            errored,
            items,
        }
    }
}

// ---------------------------------------------------------------------------
// pytest output parsing
// ---------------------------------------------------------------------------

static VERBOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\S*::(\S+))\s+(PASSED|FAILED|ERROR|SKIPPED)").unwrap()
});

static FAILURE_REASON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:FAILED|ERROR)\s+\S*::(\S+)\s+-\s+(.+)$").unwrap()
});

static ERROR_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)_{2,}\s+ERROR at (?:setup|teardown) of (\S+)\s+_{2,}\n(.*?)(\n_{2,}|\n={2,}|$)")
        .unwrap()
});

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^E\s+(.+)$").unwrap());

/// Parse `pytest -v` per-test lines (`path::test_name PASSED`).
fn parse_verbose_items(stdout: &str, reasons: &HashMap<String, String>) -> Vec<TestItemResult> {
    VERBOSE_RE
        .captures_iter(stdout)
        .map(|cap| {
            let test_name = cap[2].to_string();
            let status = match &cap[3] {
                "PASSED" => TestItemStatus::Passed,
                "FAILED" => TestItemStatus::Failed,
                "ERROR" => TestItemStatus::Error,
                _ => TestItemStatus::Skipped,
            };
            let failure_reason = reasons.get(&test_name).cloned();
            TestItemResult {
                test_name,
                status,
                failure_reason,
            }
        })
        .collect()
}

/// Failure reasons from the short test summary, backfilled from the ERRORS
/// section for setup/teardown failures the summary omits.
fn parse_failure_reasons(stdout: &str) -> HashMap<String, String> {
    let mut reasons = HashMap::new();

    for cap in FAILURE_REASON_RE.captures_iter(stdout) {
        reasons.insert(cap[1].to_string(), cap[2].trim().to_string());
    }

    for cap in ERROR_SECTION_RE.captures_iter(stdout) {
        let test_name = cap[1].to_string();
        if reasons.contains_key(&test_name) {
            continue;
        }
        let block = &cap[2];
        if let Some(last) = ERROR_LINE_RE
            .captures_iter(block)
            .last()
            .map(|c| c[1].trim().to_string())
        {
            reasons.insert(test_name, last);
        }
    }

    reasons
}

fn parse_summary_counts(stdout: &str) -> (usize, usize, usize) {
    static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
    static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
    static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) error").unwrap());

    let count = |re: &Regex| {
        re.captures(stdout)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(0)
    };
    (count(&PASSED_RE), count(&FAILED_RE), count(&ERROR_RE))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_VERBOSE: &str = "\
test_mod.py::test_add PASSED
test_mod.py::test_sub FAILED
test_mod.py::test_db ERROR
test_mod.py::test_skip SKIPPED

=========================== short test summary info ===========================
FAILED test_mod.py::test_sub - AssertionError: assert 2 == 3
=========== 1 passed, 1 failed, 1 error, 1 skipped in 0.12s ===========
";

    #[test]
    fn parses_verbose_items_with_reasons() {
        let s = PythonStrategy::new();
        let parsed = s.parse_test_output(PYTEST_VERBOSE, "", 1);
        assert_eq!(parsed.passed, 1);
        assert_eq!(parsed.failed, 1);
        assert_eq!(parsed.errored, 1);
        assert_eq!(parsed.items.len(), 4);
        let failed = parsed
            .items
            .iter()
            .find(|i| i.test_name == "test_sub")
            .unwrap();
        assert_eq!(failed.status, TestItemStatus::Failed);
        assert_eq!(
            failed.failure_reason.as_deref(),
            Some("AssertionError: assert 2 == 3")
        );
    }

    #[test]
    fn error_section_backfills_setup_failures() {
        let stdout = "\
____________________ ERROR at setup of test_conn ____________________
self = <fixture>
E       ConnectionError: refused
==================== 1 error in 0.05s ====================
";
        let reasons = parse_failure_reasons(stdout);
        assert_eq!(reasons.get("test_conn").map(String::as_str), Some("ConnectionError: refused"));
    }

    #[test]
    fn unparseable_nonzero_exit_yields_synthetic_error() {
        let s = PythonStrategy::new();
        let parsed = s.parse_test_output("", "ImportError: no module named x", 2);
        assert_eq!(parsed.errored, 1);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].status, TestItemStatus::Error);
    }

    #[test]
    fn unparseable_zero_exit_reports_zero_results() {
        let s = PythonStrategy::new();
        let parsed = s.parse_test_output("no tests ran in 0.01s", "", 0);
        assert_eq!(parsed.passed + parsed.failed + parsed.errored, 0);
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn check_build_passes_on_tree_without_python() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();
        let s = PythonStrategy::new();
        let (ok, msg) = s.check_build(dir.path(), Duration::from_secs(5));
        assert!(ok);
        assert_eq!(msg, "No python files found");
    }

    #[test]
    fn coverage_total_line_parses() {
        let stdout = "Name  Stmts  Miss  Cover\nmod.py  10  2  80%\nTOTAL  10  2  80%\n";
        assert_eq!(parse_total_percent(stdout), Some(80.0));
        assert_eq!(parse_total_percent("no totals here"), None);
    }
}
