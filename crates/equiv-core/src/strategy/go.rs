//! Go ecosystem strategy.
//!
//! Probes run through `go run`; characterization tests run through
//! `go test -v -cover`; the build gate is `go build ./...`. Coverage comes
//! straight from the test runner's "coverage: NN.N% of statements" line.

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
Generate a standalone Go program that captures behavioral output.

Source files in this module:
{file_sections}

Dependent source files (signatures of imported modules):
{dependency_info}

Testing guidance:
- Side effects: {side_effects}
- Mock recommendations: {mock_recommendations}
- Nondeterminism notes: {nondeterminism_notes}

Requirements:
- Create a main() function in package main that calls the functions from the source
- Marshal all results into a single JSON object with encoding/json
- For each function call, use descriptive keys like \"FunctionName_scenario\"
- Do NOT use generic keys like \"result1\", \"test1\", \"output\"
- Print the JSON object to stdout as the LAST line, nothing else on stdout
- No markdown code fences, return raw Go code only
- Runnable with: go run probe.go
";

const TEST_GENERATION_PROMPT: &str = "\
Generate a complete Go test file for behavioral validation.

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
1. Use the standard testing package, func TestXxx(t *testing.T)
2. Use the same package name as the source code (no separate test packages)
3. One test function per golden output key, named after the key
4. Compare with reflect.DeepEqual or direct equality, t.Errorf on mismatch
5. If a golden key has no corresponding function, skip with a comment
6. No markdown code fences, return raw Go code only
7. Runnable with: go test
";

#[derive(Debug, Default)]
pub struct GoStrategy;

impl GoStrategy {
    pub fn new() -> Self {
        Self
    }

    fn outcome_to_result(outcome: ExecOutcome, coverage_pct: Option<f64>) -> TestRunResult {
        TestRunResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            coverage_pct,
        }
    }
}

#[async_trait]
impl TargetStrategy for GoStrategy {
    fn id(&self) -> &'static str {
        "go"
    }

    fn source_extension(&self) -> &'static str {
        ".go"
    }

    fn test_file_name(&self, stem: &str) -> String {
        format!("{stem}_test.go")
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
                &build_file_sections(source_code, module_paths, "go"),
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
        _source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult {
        let script = script_path.display().to_string();
        let outcome = run_command("go", &["run", &script], work_dir, &HashMap::new(), timeout);
        // `go run` reports compile diagnostics on stderr with a nonzero
        // exit; mark them so capture can tell build breaks from crashes.
        if !outcome.timed_out
            && outcome.exit_code != 0
            && outcome.stderr.contains("syntax error")
        {
            return TestRunResult {
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: format!(
                    "{}:\n{}",
                    crate::errors::COMPILATION_FAILED_PREFIX,
                    outcome.stderr
                ),
                coverage_pct: None,
            };
        }
        Self::outcome_to_result(outcome, None)
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
        let prompt = TEST_GENERATION_PROMPT
            .replace(
                "{file_sections}",
                &build_file_sections(new_source_code, module_paths, "go"),
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
        // go test runs per package; the test file's directory is the
        // package dir when it lives inside the tree, else the first
        // source dir.
        let pkg_dir = test_file_path
            .parent()
            .filter(|p| p.starts_with(work_dir))
            .map(Path::to_path_buf)
            .or_else(|| source_dirs.first().map(|d| work_dir.join(d)))
            .unwrap_or_else(|| work_dir.to_path_buf());

        let outcome = run_command(
            "go",
            &["test", "-v", "-cover", "./..."],
            &pkg_dir,
            &HashMap::new(),
            timeout,
        );
        if outcome.timed_out {
            return Self::outcome_to_result(outcome, None);
        }
        let coverage = parse_go_coverage(&outcome.stdout);
        Self::outcome_to_result(outcome, coverage)
    }

    fn check_build(&self, repo_dir: &Path, timeout: Duration) -> (bool, String) {
        if !tree_has_extension(repo_dir, "go") {
            return (true, "No go files found".to_string());
        }
        let outcome = run_command(
            "go",
            &["build", "./..."],
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
        let items = parse_go_test_items(stdout);
        let passed = items
            .iter()
            .filter(|i| i.status == TestItemStatus::Passed)
            .count();
        let failed = items
            .iter()
            .filter(|i| i.status == TestItemStatus::Failed)
            .count();

        if items.is_empty() && exit_code != 0 {
            return synthetic_errored(if stderr.trim().is_empty() { stdout } else { stderr });
        }

        ParsedTestOutput {
            passed,
            failed,
            errored: 0,
            items,
        }
    }
}

// ---------------------------------------------------------------------------
// go test output parsing
// ---------------------------------------------------------------------------

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^--- (PASS|FAIL|SKIP): (\S+)").unwrap());

static COVERAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"coverage:\s+([\d.]+)%\s+of\s+statements").unwrap());

fn parse_go_test_items(stdout: &str) -> Vec<TestItemResult> {
    ITEM_RE
        .captures_iter(stdout)
        .map(|cap| {
            let status = match &cap[1] {
                "PASS" => TestItemStatus::Passed,
                "FAIL" => TestItemStatus::Failed,
                _ => TestItemStatus::Skipped,
            };
            let test_name = cap[2].to_string();
            let failure_reason = if status == TestItemStatus::Failed {
                extract_go_failure_reason(stdout, &test_name)
            } else {
                None
            };
            TestItemResult {
                test_name,
                status,
                failure_reason,
            }
        })
        .collect()
}

/// The indented detail lines under a `--- FAIL:` header.
fn extract_go_failure_reason(stdout: &str, test_name: &str) -> Option<String> {
    let header = format!("--- FAIL: {test_name}");
    let start = stdout.find(&header)?;
    let rest = &stdout[start..];
    let mut lines = rest.lines();
    lines.next(); // the header itself
    let detail: Vec<&str> = lines
        .take_while(|l| l.starts_with("    ") || l.starts_with('\t'))
        .map(str::trim)
        .collect();
    if detail.is_empty() {
        return None;
    }
    let mut text = detail.join("; ");
    if text.len() > 500 {
        crate::truncate_in_place(&mut text, 500);
        text.push_str("...");
    }
    Some(text)
}

fn parse_go_coverage(stdout: &str) -> Option<f64> {
    COVERAGE_RE
        .captures(stdout)
        .and_then(|cap| cap[1].parse::<f64>().ok())
}
