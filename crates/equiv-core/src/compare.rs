//! Golden comparison: re-run probes against the refactored tree and judge
//! each input against its golden record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::GoldenCaptureRunner;
use crate::generator::TextGenerator;
use crate::model::{
    ComparisonResult, ComparisonVerdict, EntryPoint, GoldenRecord, GoldenSnapshot, TestGuidance,
    TestInput,
};
use crate::normalize::OutputNormalizer;
use crate::strategy::TargetStrategy;

const DIFF_VALUE_MAX: usize = 200;

/// Re-executes capture against a refactored tree and renders a verdict per
/// input by delegating value comparison to the normalizer.
pub struct GoldenComparator {
    pub refactored_repo_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub source_dirs: Vec<String>,
    pub normalizer: OutputNormalizer,
    pub timeout: Duration,
    pub parallel: usize,
}

impl GoldenComparator {
    pub fn new(refactored_repo_dir: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            refactored_repo_dir,
            logs_dir,
            source_dirs: Vec::new(),
            normalizer: OutputNormalizer::new(),
            timeout: Duration::from_secs(30),
            parallel: 4,
        }
    }

    #[must_use]
    pub fn with_source_dirs(mut self, source_dirs: Vec<String>) -> Self {
        self.source_dirs = source_dirs;
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: OutputNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    /// Capture the refactored tree and compare every input against the
    /// baseline snapshot. Exactly one result per input, in input order.
    pub async fn run(
        &self,
        inputs: &[TestInput],
        entries: &[EntryPoint],
        guidance: &[TestGuidance],
        golden: &GoldenSnapshot,
        strategy: Arc<dyn TargetStrategy>,
        generator: Arc<dyn TextGenerator>,
    ) -> anyhow::Result<Vec<ComparisonResult>> {
        let capture = GoldenCaptureRunner::new(
            self.refactored_repo_dir.clone(),
            self.logs_dir.join("refactored"),
        )
        .with_source_dirs(self.source_dirs.clone())
        .with_timeout(self.timeout)
        .with_parallel(self.parallel);

        let actual = capture
            .run(inputs, entries, guidance, strategy, generator)
            .await?;

        Ok(inputs
            .iter()
            .map(|input| {
                compare_records(
                    input,
                    golden.get(&input.input_id),
                    actual.get(&input.input_id),
                    &self.normalizer,
                )
            })
            .collect())
    }
}

/// Verdict ladder for one input. Pure; exposed for direct testing and for
/// callers that already hold both snapshots.
pub fn compare_records(
    input: &TestInput,
    expected: Option<&GoldenRecord>,
    actual: Option<&GoldenRecord>,
    normalizer: &OutputNormalizer,
) -> ComparisonResult {
    let Some(expected) = expected else {
        return ComparisonResult {
            input_id: input.input_id.clone(),
            entry_id: input.entry_id.clone(),
            verdict: ComparisonVerdict::Skipped,
            expected_output: None,
            actual_output: None,
            diff_summary: Some("no golden record found".to_string()),
        };
    };

    let Some(actual) = actual else {
        return ComparisonResult {
            input_id: input.input_id.clone(),
            entry_id: input.entry_id.clone(),
            verdict: ComparisonVerdict::Error,
            expected_output: expected.output.clone(),
            actual_output: None,
            diff_summary: Some("no actual output captured".to_string()),
        };
    };

    // A crash on the refactored side is never a value difference; check the
    // exit codes before comparing outputs.
    if expected.exit_code == Some(0) && actual.exit_code != Some(0) {
        return ComparisonResult {
            input_id: input.input_id.clone(),
            entry_id: input.entry_id.clone(),
            verdict: ComparisonVerdict::Error,
            expected_output: expected.output.clone(),
            actual_output: actual.output.clone(),
            diff_summary: Some(format!(
                "exit code mismatch: expected 0, got {}",
                actual.exit_code.unwrap_or(-1)
            )),
        };
    }

    let norm_expected = normalizer.normalize(expected.output.as_ref());
    let norm_actual = normalizer.normalize(actual.output.as_ref());

    let (verdict, diff_summary) = if norm_expected == norm_actual {
        (ComparisonVerdict::Pass, None)
    } else {
        (
            ComparisonVerdict::Fail,
            Some(build_diff_summary(&norm_expected, &norm_actual)),
        )
    };

    ComparisonResult {
        input_id: input.input_id.clone(),
        entry_id: input.entry_id.clone(),
        verdict,
        expected_output: expected.output.clone(),
        actual_output: actual.output.clone(),
        diff_summary,
    }
}

fn build_diff_summary(expected: &str, actual: &str) -> String {
    format!(
        "expected: {}\nactual: {}",
        clip(expected, DIFF_VALUE_MAX),
        clip(actual, DIFF_VALUE_MAX)
    )
}

fn clip(text: &str, max: usize) -> String {
    if text.len() > max {
        let mut clipped = text.to_string();
        crate::truncate_in_place(&mut clipped, max);
        clipped.push_str("...");
        clipped
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(id: &str) -> TestInput {
        TestInput {
            input_id: id.to_string(),
            entry_id: format!("entry_{id}"),
            args: serde_json::Map::new(),
            description: None,
        }
    }

    fn record(id: &str, output: Option<serde_json::Value>, exit_code: i32) -> GoldenRecord {
        GoldenRecord {
            input_id: id.to_string(),
            entry_id: format!("entry_{id}"),
            output,
            exit_code: Some(exit_code),
            stderr_snippet: None,
            duration_ms: Some(1),
            coverage_pct: None,
        }
    }

    #[test]
    fn masked_timestamps_pass() {
        let n = OutputNormalizer::new();
        let exp = record("i1", Some(json!({"f_scenario": "2024-01-01T00:00:00Z"})), 0);
        let act = record("i1", Some(json!({"f_scenario": "2024-06-01T12:00:00Z"})), 0);
        let result = compare_records(&input("i1"), Some(&exp), Some(&act), &n);
        assert_eq!(result.verdict, ComparisonVerdict::Pass);
        assert!(result.diff_summary.is_none());
    }

    #[test]
    fn nonzero_actual_exit_is_error_before_value_compare() {
        let n = OutputNormalizer::new();
        // Same output both sides; the crash must still win.
        let exp = record("i1", Some(json!({"a": 1})), 0);
        let act = record("i1", Some(json!({"a": 1})), 1);
        let result = compare_records(&input("i1"), Some(&exp), Some(&act), &n);
        assert_eq!(result.verdict, ComparisonVerdict::Error);
        assert!(result
            .diff_summary
            .as_deref()
            .unwrap()
            .contains("exit code mismatch"));
    }

    #[test]
    fn missing_actual_is_error() {
        let n = OutputNormalizer::new();
        let exp = record("i1", Some(json!({"a": 1})), 0);
        let result = compare_records(&input("i1"), Some(&exp), None, &n);
        assert_eq!(result.verdict, ComparisonVerdict::Error);
        assert_eq!(
            result.diff_summary.as_deref(),
            Some("no actual output captured")
        );
    }

    #[test]
    fn missing_golden_is_skipped() {
        let n = OutputNormalizer::new();
        let act = record("i1", Some(json!({"a": 1})), 0);
        let result = compare_records(&input("i1"), None, Some(&act), &n);
        assert_eq!(result.verdict, ComparisonVerdict::Skipped);
        assert_eq!(
            result.diff_summary.as_deref(),
            Some("no golden record found")
        );
    }

    #[test]
    fn value_mismatch_fails_with_both_sides_in_summary() {
        let n = OutputNormalizer::new();
        let exp = record("i1", Some(json!({"x": 1})), 0);
        let act = record("i1", Some(json!({"x": 2})), 0);
        let result = compare_records(&input("i1"), Some(&exp), Some(&act), &n);
        assert_eq!(result.verdict, ComparisonVerdict::Fail);
        let diff = result.diff_summary.unwrap();
        assert!(diff.contains("expected: "));
        assert!(diff.contains("actual: "));
        assert!(diff.contains("{\"x\":1}"));
        assert!(diff.contains("{\"x\":2}"));
    }

    #[test]
    fn diff_values_truncate_at_200_chars() {
        let n = OutputNormalizer::new();
        let long: String = "a".repeat(400);
        let exp = record("i1", Some(json!(long)), 0);
        let act = record("i1", Some(json!("short")), 0);
        let result = compare_records(&input("i1"), Some(&exp), Some(&act), &n);
        let diff = result.diff_summary.unwrap();
        let expected_line = diff.lines().next().unwrap();
        assert_eq!(expected_line.len(), "expected: ".len() + 200 + 3);
        assert!(expected_line.ends_with("..."));
    }

    #[test]
    fn nonzero_on_both_sides_still_compares_values() {
        // The golden itself crashed; a matching crash is not a regression.
        let n = OutputNormalizer::new();
        let exp = record("i1", Some(json!({"a": 1})), 1);
        let act = record("i1", Some(json!({"a": 1})), 1);
        let result = compare_records(&input("i1"), Some(&exp), Some(&act), &n);
        assert_eq!(result.verdict, ComparisonVerdict::Pass);
    }
}
