//! Report aggregation and rendering.

use std::path::Path;

use crate::model::{
    ComparisonResult, ComparisonVerdict, GoldenSnapshot, OverallTestReport, UnitTestResult,
};

/// Pure aggregation of comparison and unit-test results into the terminal
/// report artifact.
#[derive(Debug, Default)]
pub struct ReportBuilder;

impl ReportBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        run_id: &str,
        golden_snapshot: GoldenSnapshot,
        comparison_results: Vec<ComparisonResult>,
        unit_test_results: Vec<UnitTestResult>,
    ) -> OverallTestReport {
        let total = comparison_results.len();
        let count = |v: ComparisonVerdict| {
            comparison_results
                .iter()
                .filter(|r| r.verdict == v)
                .count()
        };
        let passed = count(ComparisonVerdict::Pass);
        let failed = count(ComparisonVerdict::Fail);
        let errored = count(ComparisonVerdict::Error);
        let skipped = count(ComparisonVerdict::Skipped);

        let pass_rate = if total == 0 {
            0.0
        } else {
            round4(passed as f64 / total as f64)
        };

        let coverage_values: Vec<f64> = unit_test_results
            .iter()
            .filter_map(|r| r.coverage_pct)
            .collect();
        let coverage_pct = if coverage_values.is_empty() {
            None
        } else {
            let avg = coverage_values.iter().sum::<f64>() / coverage_values.len() as f64;
            Some((avg * 100.0).round() / 100.0)
        };

        OverallTestReport {
            run_id: run_id.to_string(),
            started_at: None,
            golden_snapshot,
            comparison_results,
            pass_rate,
            total,
            passed,
            failed,
            errored,
            skipped,
            unit_test_results,
            coverage_pct,
            build_success: None,
            build_error: None,
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Write the report artifact as pretty JSON.
pub fn write_json(report: &OverallTestReport, out: &Path) -> anyhow::Result<()> {
    std::fs::write(out, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

/// One-screen summary for CI logs, written to stderr.
pub fn print_summary(report: &OverallTestReport) {
    eprintln!(
        "run {}: {} comparisons — {} passed, {} failed, {} errored, {} skipped (pass rate {:.2}%)",
        report.run_id,
        report.total,
        report.passed,
        report.failed,
        report.errored,
        report.skipped,
        report.pass_rate * 100.0,
    );
    if let Some(cov) = report.coverage_pct {
        eprintln!("unit-test coverage: {cov:.2}%");
    }
    if let Some(false) = report.build_success {
        eprintln!(
            "build check FAILED: {}",
            report.build_error.as_deref().unwrap_or("(no diagnostic)")
        );
    }
    for r in &report.comparison_results {
        if r.verdict != ComparisonVerdict::Pass {
            let note = r.diff_summary.as_deref().unwrap_or("");
            let first_line = note.lines().next().unwrap_or("");
            match r.failure_kind() {
                Some(kind) => {
                    eprintln!("  [{:?}/{kind}] {} {}", r.verdict, r.input_id, first_line);
                }
                None => eprintln!("  [{:?}] {} {}", r.verdict, r.input_id, first_line),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestInput;
    use crate::normalize::OutputNormalizer;

    fn result(id: &str, verdict: ComparisonVerdict) -> ComparisonResult {
        ComparisonResult {
            input_id: id.to_string(),
            entry_id: format!("e_{id}"),
            verdict,
            expected_output: None,
            actual_output: None,
            diff_summary: None,
        }
    }

    #[test]
    fn empty_results_give_zero_pass_rate_not_an_error() {
        let report =
            ReportBuilder::new().build("run-1", GoldenSnapshot::default(), vec![], vec![]);
        assert_eq!(report.pass_rate, 0.0);
        assert_eq!(report.total, 0);
    }

    #[test]
    fn pass_rate_is_rounded_to_four_decimals_and_bounded() {
        let results = vec![
            result("a", ComparisonVerdict::Pass),
            result("b", ComparisonVerdict::Pass),
            result("c", ComparisonVerdict::Fail),
        ];
        let report =
            ReportBuilder::new().build("run-1", GoldenSnapshot::default(), results, vec![]);
        assert_eq!(report.pass_rate, 0.6667);
        assert!(report.pass_rate >= 0.0 && report.pass_rate <= 1.0);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn all_verdicts_are_counted() {
        let results = vec![
            result("a", ComparisonVerdict::Pass),
            result("b", ComparisonVerdict::Fail),
            result("c", ComparisonVerdict::Error),
            result("d", ComparisonVerdict::Skipped),
        ];
        let report =
            ReportBuilder::new().build("run-1", GoldenSnapshot::default(), results, vec![]);
        assert_eq!(
            (report.passed, report.failed, report.errored, report.skipped),
            (1, 1, 1, 1)
        );
        assert_eq!(report.pass_rate, 0.25);
    }

    #[test]
    fn every_input_yields_exactly_one_verdict() {
        // Verdict totality: run the comparator ladder over a mixed input set
        // and check nothing is dropped or duplicated.
        let normalizer = OutputNormalizer::new();
        let inputs: Vec<TestInput> = ["i1", "i2", "i3"]
            .iter()
            .map(|id| TestInput {
                input_id: (*id).to_string(),
                entry_id: format!("e_{id}"),
                args: serde_json::Map::new(),
                description: None,
            })
            .collect();
        let golden = GoldenSnapshot {
            records: vec![crate::model::GoldenRecord {
                input_id: "i1".into(),
                entry_id: "e_i1".into(),
                output: Some(serde_json::json!({"a": 1})),
                exit_code: Some(0),
                stderr_snippet: None,
                duration_ms: Some(1),
                coverage_pct: None,
            }],
        };
        let results: Vec<ComparisonResult> = inputs
            .iter()
            .map(|i| {
                crate::compare::compare_records(
                    i,
                    golden.get(&i.input_id),
                    None,
                    &normalizer,
                )
            })
            .collect();
        assert_eq!(results.len(), inputs.len());
        let report =
            ReportBuilder::new().build("run-1", golden, results, vec![]);
        assert_eq!(report.total, 3);
        assert_eq!(report.errored, 1); // golden present, no actual
        assert_eq!(report.skipped, 2); // no golden record
    }

    #[test]
    fn average_coverage_is_rounded() {
        let unit = vec![
            UnitTestResult {
                test_file: "t1".into(),
                total: 1,
                passed: 1,
                failed: 0,
                errored: 0,
                coverage_pct: Some(80.0),
                stdout_tail: None,
                stderr_tail: None,
                exit_code: Some(0),
                test_items: vec![],
            },
            UnitTestResult {
                test_file: "t2".into(),
                total: 1,
                passed: 1,
                failed: 0,
                errored: 0,
                coverage_pct: Some(85.335),
                stdout_tail: None,
                stderr_tail: None,
                exit_code: Some(0),
                test_items: vec![],
            },
        ];
        let report = ReportBuilder::new().build("run-1", GoldenSnapshot::default(), vec![], unit);
        assert_eq!(report.coverage_pct, Some(82.67));
    }
}
