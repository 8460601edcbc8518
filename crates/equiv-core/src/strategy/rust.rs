//! Rust ecosystem strategy.
//!
//! Probes run through `cargo run --release` when the tree has a manifest,
//! falling back to a direct `rustc` compile-and-run for standalone scripts.
//! Tests run through `cargo test`; coverage comes from cargo-tarpaulin when
//! its report is present.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use super::exec::{run_command, ExecOutcome};
use super::{
    build_file_sections, find_files_named, guidance_mocks, guidance_notes,
    guidance_side_effects, strip_code_fences, synthetic_errored, tree_has_extension,
    ParsedTestOutput, TargetStrategy, SYSTEM_GOLDEN_SCRIPT, SYSTEM_TEST_GENERATION,
};
use crate::errors::COMPILATION_FAILED_PREFIX;
use crate::generator::TextGenerator;
use crate::model::{TestGuidance, TestItemResult, TestItemStatus, TestRunResult};

const GOLDEN_SCRIPT_PROMPT: &str = "\
Generate a standalone Rust program that captures behavioral output.

Source files in this module:
{file_sections}

Dependent source files (signatures of imported modules):
{dependency_info}

Testing guidance:
- Side effects: {side_effects}
- Mock recommendations: {mock_recommendations}
- Nondeterminism notes: {nondeterminism_notes}

Requirements:
- Create a main() function that calls the functions from the source
- Use `mod` or `use` to import the source module
- Use serde_json to output results as JSON
- For each function call, use descriptive keys like \"FunctionName_scenario\"
- Do NOT use generic keys like \"result1\", \"test1\", \"output\"
- Output JSON to stdout using println! with serde_json::to_string
- Add `serde` and `serde_json` as dependencies if needed
- No markdown code fences, return raw Rust code only
- Runnable with: cargo run
";

const TEST_GENERATION_PROMPT: &str = "\
Generate a complete Rust test module for behavioral validation.

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
1. Create a test module with #[cfg(test)] mod tests
2. Use #[test] attribute for each test function
3. Use assert_eq!, assert!, or custom assertions
4. Test function names: test_<name> following Rust conventions
5. For floating point comparisons, use approximate equality
6. If a golden key has no corresponding function, skip with comment
7. No markdown code fences, return raw Rust code only
8. Runnable with: cargo test
9. Import necessary items with `use super::*;` or specific imports
";

#[derive(Debug, Default)]
pub struct RustStrategy;

impl RustStrategy {
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

    /// Compile a standalone script with rustc, then run the binary.
    fn run_standalone(
        script_path: &Path,
        work_dir: &Path,
        timeout: Duration,
    ) -> TestRunResult {
        let binary = script_path.with_extension("bin");
        let binary_str = binary.display().to_string();
        let script_str = script_path.display().to_string();

        let compile = run_command(
            "rustc",
            &["-o", &binary_str, &script_str],
            work_dir,
            &HashMap::new(),
            timeout,
        );
        if compile.timed_out {
            return Self::outcome_to_result(compile, None);
        }
        if compile.exit_code != 0 {
            return TestRunResult {
                exit_code: compile.exit_code,
                stdout: compile.stdout,
                stderr: format!("{COMPILATION_FAILED_PREFIX}:\n{}", compile.stderr),
                coverage_pct: None,
            };
        }

        let run = run_command(&binary_str, &[], work_dir, &HashMap::new(), timeout);
        Self::outcome_to_result(run, None)
    }
}

#[async_trait]
impl TargetStrategy for RustStrategy {
    fn id(&self) -> &'static str {
        "rust"
    }

    fn source_extension(&self) -> &'static str {
        ".rs"
    }

    fn test_file_name(&self, stem: &str) -> String {
        format!("{stem}_test.rs")
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
                &build_file_sections(source_code, module_paths, "rust"),
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
        if !work_dir.join("Cargo.toml").exists() {
            return Self::run_standalone(script_path, work_dir, timeout);
        }
        let outcome = run_command(
            "cargo",
            &["run", "--release"],
            work_dir,
            &HashMap::new(),
            timeout,
        );
        // Coverage needs an external tool (tarpaulin); probes report none.
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
                &build_file_sections(new_source_code, module_paths, "rust"),
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
        _test_file_path: &Path,
        work_dir: &Path,
        source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult {
        // The test module is expected to be integrated into the crate under
        // work_dir; cargo discovers it. When the root has no manifest, fall
        // back to the first source dir that carries one.
        let mut cargo_dir = work_dir.to_path_buf();
        if !cargo_dir.join("Cargo.toml").exists() {
            for dir in source_dirs {
                let candidate = work_dir.join(dir);
                if candidate.join("Cargo.toml").exists() {
                    cargo_dir = candidate;
                    break;
                }
            }
        }

        let outcome = run_command(
            "cargo",
            &["test", "--", "--nocapture"],
            &cargo_dir,
            &HashMap::new(),
            timeout,
        );
        if outcome.timed_out {
            return Self::outcome_to_result(outcome, None);
        }
        let coverage = parse_tarpaulin_coverage(&cargo_dir, &outcome.stdout);
        Self::outcome_to_result(outcome, coverage)
    }

    fn check_build(&self, repo_dir: &Path, timeout: Duration) -> (bool, String) {
        let manifests = find_files_named(repo_dir, "Cargo.toml");

        if manifests.is_empty() {
            if !tree_has_extension(repo_dir, "rs") {
                return (true, "No rust files found".to_string());
            }
            // Standalone sources: metadata-only compile of each file.
            let mut all_ok = true;
            let mut output = Vec::new();
            visit_rs_files(repo_dir, &mut |rs_file| {
                let file_str = rs_file.display().to_string();
                let outcome = run_command(
                    "rustc",
                    &["--emit=metadata", "-o", "/dev/null", &file_str],
                    repo_dir,
                    &HashMap::new(),
                    timeout,
                );
                let name = rs_file
                    .file_name()
                    .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
                if outcome.exit_code != 0 {
                    all_ok = false;
                    output.push(format!("{name}: {}", outcome.stderr));
                } else {
                    output.push(format!("{name}: OK"));
                }
            });
            return (all_ok, output.join("\n"));
        }

        let mut all_ok = true;
        let mut output = Vec::new();
        for manifest in manifests {
            let Some(cargo_dir) = manifest.parent() else {
                continue;
            };
            let outcome = run_command("cargo", &["check"], cargo_dir, &HashMap::new(), timeout);
            if outcome.timed_out {
                return (false, format!("TIMEOUT in {}", cargo_dir.display()));
            }
            let rel = cargo_dir.strip_prefix(repo_dir).unwrap_or(cargo_dir);
            output.push(format!(
                "Dir: {}\n{}{}",
                rel.display(),
                outcome.stdout,
                outcome.stderr
            ));
            if outcome.exit_code != 0 {
                all_ok = false;
            }
        }
        (all_ok, output.join("\n"))
    }

    fn parse_test_output(&self, stdout: &str, stderr: &str, exit_code: i32) -> ParsedTestOutput {
        let items = parse_libtest_items(stdout);
        let (passed, failed) = parse_libtest_summary(stdout);
        let mut errored = 0;

        if exit_code != 0 && passed == 0 && failed == 0 && items.is_empty() {
            return synthetic_errored(if stderr.trim().is_empty() { stdout } else { stderr });
        }
        if exit_code != 0 && passed == 0 && failed == 0 {
            errored = 1;
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
// libtest / tarpaulin output parsing
// ---------------------------------------------------------------------------

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^test\s+(\S+)\s+\.\.\.\s+(ok|FAILED|ignored)").unwrap());

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result:.*?(\d+)\s+passed.*?(\d+)\s+failed.*?(\d+)\s+ignored").unwrap()
});

static TARPAULIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)%\s+coverage").unwrap());

fn parse_libtest_items(stdout: &str) -> Vec<TestItemResult> {
    ITEM_RE
        .captures_iter(stdout)
        .map(|cap| {
            let test_name = cap[1].to_string();
            let status = match &cap[2] {
                "ok" => TestItemStatus::Passed,
                "FAILED" => TestItemStatus::Failed,
                _ => TestItemStatus::Skipped,
            };
            let failure_reason = if status == TestItemStatus::Failed {
                extract_failure_reason(stdout, &test_name)
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

/// Panic text from the per-test stdout section libtest prints on failure.
fn extract_failure_reason(stdout: &str, test_name: &str) -> Option<String> {
    let pattern = format!(
        r"(?s)---- {} stdout ----\n(.*?)(\n----|\nfailures:|$)",
        regex::escape(test_name)
    );
    let re = Regex::new(&pattern).ok()?;
    let cap = re.captures(stdout)?;
    let mut text = cap[1].trim().to_string();
    if text.len() > 500 {
        crate::truncate_in_place(&mut text, 500);
        text.push_str("...");
    }
    Some(text)
}

fn parse_libtest_summary(stdout: &str) -> (usize, usize) {
    SUMMARY_RE.captures(stdout).map_or((0, 0), |cap| {
        (
            cap[1].parse().unwrap_or(0),
            cap[2].parse().unwrap_or(0),
            // ignored tests are not errors
        )
    })
}

fn parse_tarpaulin_coverage(work_dir: &Path, stdout: &str) -> Option<f64> {
    if let Some(cap) = TARPAULIN_RE.captures(stdout) {
        if let Ok(pct) = cap[1].parse::<f64>() {
            return Some(pct);
        }
    }
    let report = work_dir.join("tarpaulin-report.json");
    let text = std::fs::read_to_string(report).ok()?;
    let data: serde_json::Value = serde_json::from_str(&text).ok()?;
    data["coverage"].as_f64()
}

fn visit_rs_files(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            visit_rs_files(&path, visit);
        } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARGO_TEST_OUTPUT: &str = "\
running 3 tests
test tests::test_add ... ok
test tests::test_sub ... FAILED
test tests::test_slow ... ignored

---- tests::test_sub stdout ----
thread 'tests::test_sub' panicked at src/lib.rs:10:
assertion `left == right` failed

failures:
    tests::test_sub

test result: FAILED. 1 passed; 1 failed; 1 ignored; 0 measured; 0 filtered out
";

    #[test]
    fn parses_libtest_items_and_summary() {
        let s = RustStrategy::new();
        let parsed = s.parse_test_output(CARGO_TEST_OUTPUT, "", 101);
        assert_eq!(parsed.passed, 1);
        assert_eq!(parsed.failed, 1);
        assert_eq!(parsed.errored, 0);
        assert_eq!(parsed.items.len(), 3);
        let failed = parsed
            .items
            .iter()
            .find(|i| i.test_name == "tests::test_sub")
            .unwrap();
        assert_eq!(failed.status, TestItemStatus::Failed);
        assert!(failed
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("panicked"));
        let ignored = parsed
            .items
            .iter()
            .find(|i| i.test_name == "tests::test_slow")
            .unwrap();
        assert_eq!(ignored.status, TestItemStatus::Skipped);
    }

    #[test]
    fn compile_error_output_yields_synthetic_error() {
        let s = RustStrategy::new();
        let parsed = s.parse_test_output("", "error[E0425]: cannot find value `x`", 101);
        assert_eq!(parsed.errored, 1);
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].status, TestItemStatus::Error);
    }

    #[test]
    fn tarpaulin_stdout_coverage_parses() {
        let dir = tempfile::tempdir().unwrap();
        let cov =
            parse_tarpaulin_coverage(dir.path(), "52.30% coverage, 123/235 lines covered");
        assert_eq!(cov, Some(52.30));
    }

    #[test]
    fn tarpaulin_report_file_is_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tarpaulin-report.json"),
            r#"{"coverage": 71.5}"#,
        )
        .unwrap();
        assert_eq!(parse_tarpaulin_coverage(dir.path(), ""), Some(71.5));
    }

    #[test]
    fn check_build_passes_on_tree_without_rust() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1").unwrap();
        let s = RustStrategy::new();
        let (ok, msg) = s.check_build(dir.path(), Duration::from_secs(5));
        assert!(ok);
        assert_eq!(msg, "No rust files found");
    }
}
