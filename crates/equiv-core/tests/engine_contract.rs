//! Engine contract tests driven by a scripted strategy, so no real
//! toolchain is needed: probe "executions" pop pre-queued outcomes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use equiv_core::generator::{StubGenerator, TextGenerator};
use equiv_core::model::{
    EntryPoint, GoldenSnapshot, RunConfig, TestGuidance, TestInput, TestItemResult,
    TestItemStatus, TestRunResult,
};
use equiv_core::strategy::{ParsedTestOutput, StrategyRegistry, TargetStrategy};
use equiv_core::{ComparisonVerdict, GoldenCaptureRunner, GoldenComparator};

struct ScriptedStrategy {
    run_results: Mutex<VecDeque<TestRunResult>>,
    test_results: Mutex<VecDeque<TestRunResult>>,
}

impl ScriptedStrategy {
    fn new() -> Self {
        Self {
            run_results: Mutex::new(VecDeque::new()),
            test_results: Mutex::new(VecDeque::new()),
        }
    }

    fn queue_run(&self, result: TestRunResult) {
        self.run_results.lock().unwrap().push_back(result);
    }

    fn queue_test(&self, result: TestRunResult) {
        self.test_results.lock().unwrap().push_back(result);
    }
}

fn ok_result(stdout: &str) -> TestRunResult {
    TestRunResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        coverage_pct: None,
    }
}

#[async_trait]
impl TargetStrategy for ScriptedStrategy {
    fn id(&self) -> &'static str {
        "scripted"
    }

    fn source_extension(&self) -> &'static str {
        ".txt"
    }

    fn test_file_name(&self, stem: &str) -> String {
        format!("{stem}_test.txt")
    }

    async fn generate_probe_script(
        &self,
        _source_code: &str,
        module_paths: &[String],
        _dep_signatures: &str,
        _guidance: Option<&TestGuidance>,
        generator: &dyn TextGenerator,
    ) -> anyhow::Result<String> {
        generator
            .generate(&format!("probe for {}", module_paths.join(",")), None)
            .await
    }

    fn run_with_coverage(
        &self,
        _script_path: &Path,
        _work_dir: &Path,
        _source_dirs: &[String],
        _timeout: Duration,
    ) -> TestRunResult {
        self.run_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_result("{}"))
    }

    async fn generate_test_file(
        &self,
        _new_source_code: &str,
        _module_paths: &[String],
        golden_values: &serde_json::Map<String, serde_json::Value>,
        _dep_signatures: &str,
        _guidance: Option<&TestGuidance>,
        _generator: &dyn TextGenerator,
    ) -> anyhow::Result<String> {
        Ok(format!("assert {}", serde_json::to_string(golden_values)?))
    }

    fn run_tests(
        &self,
        _test_file_path: &Path,
        _work_dir: &Path,
        _source_dirs: &[String],
        _timeout: Duration,
    ) -> TestRunResult {
        self.test_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_result(""))
    }

    fn check_build(&self, _repo_dir: &Path, _timeout: Duration) -> (bool, String) {
        (true, "No scripted files found".to_string())
    }

    fn parse_test_output(&self, stdout: &str, stderr: &str, exit_code: i32) -> ParsedTestOutput {
        let mut parsed = ParsedTestOutput::default();
        for line in stdout.lines() {
            if let Some(name) = line.strip_prefix("PASS ") {
                parsed.passed += 1;
                parsed.items.push(TestItemResult {
                    test_name: name.to_string(),
                    status: TestItemStatus::Passed,
                    failure_reason: None,
                });
            } else if let Some(name) = line.strip_prefix("FAIL ") {
                parsed.failed += 1;
                parsed.items.push(TestItemResult {
                    test_name: name.to_string(),
                    status: TestItemStatus::Failed,
                    failure_reason: None,
                });
            }
        }
        if parsed.items.is_empty() && exit_code != 0 {
            parsed.errored = 1;
            parsed.items.push(TestItemResult {
                test_name: "<suite>".to_string(),
                status: TestItemStatus::Error,
                failure_reason: Some(stderr.to_string()),
            });
        }
        parsed
    }
}

fn entry(id: &str, module: &str) -> EntryPoint {
    EntryPoint {
        entry_id: id.to_string(),
        module_path: module.to_string(),
        function_name: format!("fn_{id}"),
        signature: None,
        docstring: None,
        dep_signatures: None,
    }
}

fn input(id: &str, entry_id: &str) -> TestInput {
    TestInput {
        input_id: id.to_string(),
        entry_id: entry_id.to_string(),
        args: serde_json::Map::new(),
        description: None,
    }
}

/// Tree with one scripted module file, so capture's source read succeeds.
fn source_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("mod.txt"), "scripted module source").unwrap();
    dir
}

#[tokio::test]
async fn capture_is_total_and_preserves_input_order() -> anyhow::Result<()> {
    let repo = source_tree();
    let logs = tempfile::tempdir()?;
    let strategy = Arc::new(ScriptedStrategy::new());
    strategy.queue_run(ok_result("{\"f_one\": 1}"));
    strategy.queue_run(TestRunResult {
        exit_code: -1,
        stdout: String::new(),
        stderr: "TIMEOUT".to_string(),
        coverage_pct: None,
    });
    strategy.queue_run(TestRunResult {
        exit_code: 1,
        stdout: "partial".to_string(),
        stderr: "boom".to_string(),
        coverage_pct: None,
    });

    let entries = vec![entry("e1", "mod.txt")];
    let inputs = vec![input("i1", "e1"), input("i2", "e1"), input("i3", "e1")];

    let runner = GoldenCaptureRunner::new(
        repo.path().to_path_buf(),
        logs.path().join("golden"),
    )
    .with_parallel(1);
    let snapshot = runner
        .run(
            &inputs,
            &entries,
            &[],
            strategy.clone(),
            Arc::new(StubGenerator::default()),
        )
        .await?;

    assert_eq!(snapshot.records.len(), 3);
    let ids: Vec<&str> = snapshot
        .records
        .iter()
        .map(|r| r.input_id.as_str())
        .collect();
    assert_eq!(ids, vec!["i1", "i2", "i3"]);

    let ok = &snapshot.records[0];
    assert_eq!(ok.exit_code, Some(0));
    assert_eq!(ok.output, Some(json!({"f_one": 1})));
    assert!(ok.duration_ms.is_some());

    let timed_out = &snapshot.records[1];
    assert_eq!(timed_out.exit_code, Some(-1));
    assert_eq!(timed_out.stderr_snippet.as_deref(), Some("TIMEOUT"));
    assert_eq!(timed_out.output, None);

    let crashed = &snapshot.records[2];
    assert_eq!(crashed.exit_code, Some(1));
    assert_eq!(crashed.stderr_snippet.as_deref(), Some("boom"));
    assert_eq!(crashed.output, Some(json!("partial")));

    // Probe script and execution log persisted per input.
    assert!(logs.path().join("golden/i1/mod_txt_probe.txt").is_file());
    assert!(logs.path().join("golden/i1/execution.log").is_file());
    Ok(())
}

#[tokio::test]
async fn capture_records_failed_generation_without_aborting_siblings() -> anyhow::Result<()> {
    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(
            &self,
            prompt: &str,
            _system_override: Option<&str>,
        ) -> anyhow::Result<String> {
            if prompt.contains("mod.txt") {
                anyhow::bail!("scripted generator outage")
            }
            Ok("probe".to_string())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    let repo = source_tree();
    std::fs::write(repo.path().join("other.txt"), "second module").unwrap();
    let logs = tempfile::tempdir()?;
    let strategy = Arc::new(ScriptedStrategy::new());
    strategy.queue_run(ok_result("{\"g\": 2}"));

    let entries = vec![entry("e1", "mod.txt"), entry("e2", "other.txt")];
    let inputs = vec![input("i1", "e1"), input("i2", "e2")];

    let runner =
        GoldenCaptureRunner::new(repo.path().to_path_buf(), logs.path().to_path_buf())
            .with_parallel(1);
    let snapshot = runner
        .run(&inputs, &entries, &[], strategy, Arc::new(FailingGenerator))
        .await?;

    assert_eq!(snapshot.records.len(), 2);
    let failed = &snapshot.records[0];
    assert_eq!(failed.exit_code, None);
    assert!(failed
        .stderr_snippet
        .as_deref()
        .unwrap()
        .contains("probe generation failed"));
    let ok = &snapshot.records[1];
    assert_eq!(ok.output, Some(json!({"g": 2})));
    Ok(())
}

#[tokio::test]
async fn comparator_applies_the_full_verdict_ladder() -> anyhow::Result<()> {
    let refactored = source_tree();
    let logs = tempfile::tempdir()?;

    let entries = vec![entry("e1", "mod.txt")];
    let inputs = vec![
        input("i_pass", "e1"),
        input("i_exit", "e1"),
        input("i_fail", "e1"),
        input("i_skip", "e1"),
    ];

    // Golden side: i_skip deliberately has no record.
    let golden = GoldenSnapshot {
        records: vec![
            equiv_core::GoldenRecord {
                input_id: "i_pass".into(),
                entry_id: "e1".into(),
                output: Some(json!({"ts": "2024-01-01T00:00:00Z", "v": 7})),
                exit_code: Some(0),
                stderr_snippet: None,
                duration_ms: Some(3),
                coverage_pct: None,
            },
            equiv_core::GoldenRecord {
                input_id: "i_exit".into(),
                entry_id: "e1".into(),
                output: Some(json!({"a": 1})),
                exit_code: Some(0),
                stderr_snippet: None,
                duration_ms: Some(3),
                coverage_pct: None,
            },
            equiv_core::GoldenRecord {
                input_id: "i_fail".into(),
                entry_id: "e1".into(),
                output: Some(json!({"x": 1})),
                exit_code: Some(0),
                stderr_snippet: None,
                duration_ms: Some(3),
                coverage_pct: None,
            },
        ],
    };

    // Actual side, queued in input order: masked-timestamp pass, crash,
    // value change, and one extra for i_skip.
    let strategy = Arc::new(ScriptedStrategy::new());
    strategy.queue_run(ok_result(r#"{"ts": "2030-06-01T12:30:45Z", "v": 7}"#));
    strategy.queue_run(TestRunResult {
        exit_code: 1,
        stdout: r#"{"a": 1}"#.to_string(),
        stderr: "panic".to_string(),
        coverage_pct: None,
    });
    strategy.queue_run(ok_result(r#"{"x": 2}"#));
    strategy.queue_run(ok_result(r#"{"anything": true}"#));

    let comparator = GoldenComparator::new(
        refactored.path().to_path_buf(),
        logs.path().to_path_buf(),
    )
    .with_parallel(1);
    let results = comparator
        .run(
            &inputs,
            &entries,
            &[],
            &golden,
            strategy,
            Arc::new(StubGenerator::default()),
        )
        .await?;

    // Verdict totality: one result per input, in order.
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].input_id, "i_pass");
    assert_eq!(results[0].verdict, ComparisonVerdict::Pass);

    assert_eq!(results[1].verdict, ComparisonVerdict::Error);
    assert!(results[1]
        .diff_summary
        .as_deref()
        .unwrap()
        .contains("exit code mismatch: expected 0, got 1"));

    assert_eq!(results[2].verdict, ComparisonVerdict::Fail);
    let diff = results[2].diff_summary.as_deref().unwrap();
    assert!(diff.contains("expected:"));
    assert!(diff.contains("actual:"));

    assert_eq!(results[3].verdict, ComparisonVerdict::Skipped);
    assert_eq!(
        results[3].diff_summary.as_deref(),
        Some("no golden record found")
    );
    Ok(())
}

#[tokio::test]
async fn pipeline_produces_artifacts_and_aggregate_report() -> anyhow::Result<()> {
    let repo = source_tree();
    let refactored = source_tree();
    let artifacts = tempfile::tempdir()?;

    let strategy = Arc::new(ScriptedStrategy::new());
    // Golden capture for i1, i2.
    strategy.queue_run(ok_result(r#"{"x": 1}"#));
    strategy.queue_run(ok_result(r#"{"y": "ok"}"#));
    // Refactored capture for i1 (match), i2 (crash).
    strategy.queue_run(ok_result(r#"{"x": 1}"#));
    strategy.queue_run(TestRunResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: "refactor crash".to_string(),
        coverage_pct: None,
    });
    // Emitted test execution: one file for the module.
    strategy.queue_test(TestRunResult {
        exit_code: 1,
        stdout: "PASS t_one\nFAIL t_two\n".to_string(),
        stderr: String::new(),
        coverage_pct: Some(64.0),
    });

    let mut registry = StrategyRegistry::new();
    registry.register(strategy);

    let cfg = RunConfig {
        repo_dir: repo.path().to_path_buf(),
        refactored_repo_dir: Some(refactored.path().to_path_buf()),
        ecosystem: "scripted".to_string(),
        source_dirs: vec![],
        entries: vec![entry("e1", "mod.txt")],
        inputs: vec![input("i1", "e1"), input("i2", "e1")],
        guidance: vec![],
        timeout_secs: 5,
        test_timeout_secs: 5,
        parallel: 1,
        generator: Default::default(),
    };

    let report = equiv_core::pipeline::run_characterization(
        &cfg,
        &registry,
        None,
        artifacts.path(),
    )
    .await?;

    assert_eq!(report.total, 2);
    assert_eq!(report.passed, 1);
    assert_eq!(report.errored, 1);
    assert_eq!(report.pass_rate, 0.5);
    assert_eq!(report.build_success, Some(true));
    assert!(report.started_at.is_some());

    assert_eq!(report.unit_test_results.len(), 1);
    let unit = &report.unit_test_results[0];
    assert_eq!((unit.passed, unit.failed, unit.errored), (1, 1, 0));
    assert_eq!(unit.coverage_pct, Some(64.0));
    assert_eq!(report.coverage_pct, Some(64.0));

    // Artifact layout.
    let run_dir = artifacts.path().join(&report.run_id);
    assert!(run_dir.join("golden_snapshot.json").is_file());
    assert!(run_dir.join("overall_report.json").is_file());
    assert!(run_dir.join("emitted/mod_test.txt").is_file());

    // Fallback emission: one placeholder case per golden key, literal
    // expected value embedded.
    let emitted = std::fs::read_to_string(run_dir.join("emitted/mod_test.txt"))?;
    assert!(emitted.contains("fn test_x"));
    assert!(emitted.contains("fn test_y"));
    assert!(emitted.contains("\"ok\""));

    // The persisted report round-trips.
    let text = std::fs::read_to_string(run_dir.join("overall_report.json"))?;
    let parsed: equiv_core::OverallTestReport = serde_json::from_str(&text)?;
    assert_eq!(parsed.pass_rate, report.pass_rate);
    Ok(())
}
